use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::LoggingConfig;

/// Initialise the global tracing subscriber from the logging section.
///
/// `RUST_LOG` wins over `logging.level` when set. Returns the appender guard
/// when a log file is configured; the caller must keep it alive for the
/// process lifetime or buffered lines are dropped on exit.
pub fn setup_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", config.level)));

    let json_format = config.format_type.eq_ignore_ascii_case("json");

    let (writer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    if json_format {
        let file_layer = writer.map(|w| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(w)
                .boxed()
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .with(file_layer)
            .init();
    } else {
        let file_layer = writer.map(|w| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(w)
                .boxed()
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .with(file_layer)
            .init();
    }

    guard
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().unwrap_or_else(|| "rec.log".as_ref());
    let appender = tracing_appender::rolling::daily(dir, name);
    tracing_appender::non_blocking(appender)
}
