//! `rec` - the Rootly edge connector.
//!
//! Startup order: configuration, tracing, metrics, action catalog, git
//! checkouts, catalog registration, worker pool, poller. Shutdown reverses
//! it: a signal cancels the root token, the poller stops claiming, the pool
//! drains, and the process exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rec_common::AppConfig;
use rec_core::api::{ApiClient, Reporter};
use rec_core::exec::{Executor, HttpRunner, ScriptRunner};
use rec_core::model::catalog::ActionCatalog;
use rec_core::pipeline::{Poller, WorkerPool};
use rec_core::source::GitSourceManager;

#[derive(Parser)]
#[command(name = "rec")]
#[command(about = "Rootly edge connector")]
#[command(version)]
struct Cli {
    /// Path to the main configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the actions file
    #[arg(long)]
    actions: PathBuf,

    /// Validate configuration and actions, print the action table, and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let catalog = match ActionCatalog::load(&cli.actions) {
        Ok(catalog) => catalog,
        Err(err) => {
            eprintln!("actions file error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.validate {
        print_action_table(&catalog);
        return ExitCode::SUCCESS;
    }

    let _guard = rec_common::tracing::setup_tracing(&config.logging);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, catalog)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Agent terminated with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig, catalog: ActionCatalog) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        actions = catalog.len(),
        "Starting Rootly edge connector"
    );

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    if config.metrics.enabled {
        let metrics_config = config.metrics.clone();
        let metrics_token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = rec_server::serve(metrics_config, metrics_token).await {
                warn!(error = %err, "Metrics server failed");
            }
        });
    }

    let client = Arc::new(ApiClient::new(&config.rootly)?);
    let reporter = Arc::new(Reporter::new(Arc::clone(&client)));

    // Git checkouts live under the user's home; a failed clone disables the
    // affected actions but never the agent.
    let sources = Arc::new(GitSourceManager::new(checkout_root()));
    for opts in catalog.git_sources() {
        if let Err(err) = sources.download(opts).await {
            warn!(url = %opts.url, error = %err, "Could not prepare git source");
        }
    }
    let _pull_task = sources.start_periodic_pull(token.clone());

    match client.register_actions(&catalog).await {
        Ok(outcome) => {
            info!(
                automatic = outcome.registered.automatic,
                callable = outcome.registered.callable,
                failed = outcome.failed,
                "Registered action catalog"
            );
            for failure in &outcome.failures {
                warn!(slug = %failure.slug, reason = %failure.reason, "Action not registered");
            }
        }
        Err(err) => warn!(error = %err, "Action registration failed, continuing"),
    }

    let executor = Arc::new(Executor::new(
        catalog,
        ScriptRunner::new(config.security.clone(), Arc::clone(&sources)),
        HttpRunner::new(),
        Arc::clone(&reporter),
    ));

    let pool = Arc::new(WorkerPool::new(config.pool.clone(), executor));
    pool.start(token.clone()).await;

    let poller = Poller::new(client, reporter, Arc::clone(&pool), config.poller.clone());
    poller.run(token.clone()).await;

    // Poller only returns once the token is cancelled; drain what's queued.
    pool.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn checkout_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rec")
        .join("repos")
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Signal received, starting graceful shutdown");
        token.cancel();
    });
}

#[allow(clippy::expect_used)] // Signal handler setup is infallible in practice; panic is acceptable
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_action_table(catalog: &ActionCatalog) {
    println!(
        "{:<24} {:<8} {:<28} {:<7} {:>7}",
        "ID", "KIND", "TRIGGER", "SOURCE", "TIMEOUT"
    );
    for action in catalog.actions() {
        let source = match action.source {
            rec_core::SourceType::Local => "local",
            rec_core::SourceType::Git => "git",
        };
        println!(
            "{:<24} {:<8} {:<28} {:<7} {:>6}s",
            action.id,
            action.kind.as_str(),
            action.trigger_event_type,
            source,
            action.timeout_seconds
        );
    }
    println!("\n{} action(s), configuration valid", catalog.len());
}
