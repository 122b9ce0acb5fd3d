//! Child-process execution for script actions.
//!
//! The runner owns the full subprocess lifecycle: resolving the script path
//! (holding the repo read lock for git sources), building the child
//! environment, enforcing the deadline with a graceful-then-forceful kill,
//! and draining both output streams into bounded buffers. It never buffers
//! an unbounded child stream.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rec_common::config::SecurityConfig;

use crate::model::action::{Action, SourceType};
use crate::model::execution::{
    ExecutionResult, OUTPUT_CAP, TIMEOUT_EXIT_CODE, TRUNCATION_SENTINEL,
};
use crate::source::GitSourceManager;

/// Control-plane variables never exposed to children.
const SENSITIVE_ENV: &[&str] = &["REC_API_KEY", "REC_API_URL", "REC_API_PATH"];

/// Time between the graceful and the forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code reported when the child is torn down by cancellation (128 +
/// SIGTERM).
const CANCELLED_EXIT_CODE: i32 = 143;

pub struct ScriptRunner {
    security: SecurityConfig,
    sources: Arc<GitSourceManager>,
}

impl ScriptRunner {
    pub fn new(security: SecurityConfig, sources: Arc<GitSourceManager>) -> Self {
        Self { security, sources }
    }

    /// Run the action's script with `params` exposed as `REC_PARAM_*`
    /// environment variables. Never returns an `Err`: every failure mode
    /// folds into a `failed` [`ExecutionResult`] with the cause in stderr.
    pub async fn run(
        &self,
        delivery_id: &str,
        action: &Action,
        params: &BTreeMap<String, String>,
        token: &CancellationToken,
    ) -> ExecutionResult {
        let result = ExecutionResult::started(delivery_id, &action.id, action.display_name());

        // For git sources the read lock spans path resolution and the whole
        // child lifetime, so a pull can never swap the tree under us.
        let mut _repo_guard = None;
        let script = match self.resolve_script(action, &mut _repo_guard).await {
            Ok(path) => path,
            Err(message) => return result.fail_with(1, message),
        };

        if let Err(message) = self.check_allowed(&script) {
            return result.fail_with(1, message);
        }

        let mut cmd = Command::new(&script);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        for var in SENSITIVE_ENV {
            cmd.env_remove(var);
        }
        cmd.envs(&self.security.global_env);
        cmd.envs(&action.env);
        for (name, value) in params {
            cmd.env(param_env_key(name), value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return result.fail_with(
                    1,
                    format!("failed to spawn script {}: {err}", script.display()),
                );
            }
        };
        debug!(script = %script.display(), action = %action.id, "Script started");

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(drain_capped(stream)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(drain_capped(stream)));

        let deadline = Duration::from_secs(
            action
                .timeout_seconds
                .min(self.security.script_timeout),
        );

        #[derive(Clone, Copy)]
        enum Outcome {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(err) => {
                    return result.fail_with(1, format!("failed to wait for script: {err}"));
                }
            },
            _ = tokio::time::sleep(deadline) => Outcome::TimedOut,
            _ = token.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => Some(status),
            Outcome::TimedOut | Outcome::Cancelled => {
                self.shutdown_child(&mut child).await;
                None
            }
        };

        let stdout = collect(stdout_task).await;
        let mut stderr = collect(stderr_task).await;

        match status {
            Some(status) => {
                let exit_code = status.code().unwrap_or(-1);
                result.finish(status.success(), exit_code, stdout, stderr)
            }
            None if matches!(outcome, Outcome::Cancelled) => {
                stderr.push_str("\nexecution cancelled during shutdown");
                result.finish(false, CANCELLED_EXIT_CODE, stdout, stderr)
            }
            None => {
                stderr.push_str(&format!(
                    "\nscript timed out after {}s",
                    deadline.as_secs()
                ));
                result.finish(false, TIMEOUT_EXIT_CODE, stdout, stderr)
            }
        }
    }

    /// Resolve the script's absolute path, taking the repo read lock for git
    /// sources. Error strings become the failed result's stderr.
    async fn resolve_script(
        &self,
        action: &Action,
        repo_guard: &mut Option<tokio::sync::OwnedRwLockReadGuard<()>>,
    ) -> Result<PathBuf, String> {
        let relative = action
            .script_path
            .as_ref()
            .ok_or_else(|| format!("action '{}' has no script path", action.id))?;

        match action.source {
            SourceType::Local => relative
                .canonicalize()
                .map_err(|_| format!("script not found: {}", relative.display())),
            SourceType::Git => {
                let opts = action
                    .git_options
                    .as_ref()
                    .ok_or_else(|| format!("action '{}' has no git options", action.id))?;
                *repo_guard = Some(
                    self.sources
                        .read_lock(&opts.url)
                        .await
                        .map_err(|err| err.to_string())?,
                );
                self.sources
                    .script_path(&opts.url, relative)
                    .await
                    .map_err(|err| err.to_string())
            }
        }
    }

    fn check_allowed(&self, script: &Path) -> Result<(), String> {
        if self.security.allowed_script_paths.is_empty() {
            return Ok(());
        }
        let permitted = self.security.allowed_script_paths.iter().any(|root| {
            root.canonicalize()
                .map(|root| script.starts_with(root))
                .unwrap_or(false)
        });
        if permitted {
            Ok(())
        } else {
            Err(format!("script path not allowed: {}", script.display()))
        }
    }

    /// Graceful termination: SIGTERM, a grace window, then SIGKILL.
    async fn shutdown_child(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            terminate(pid);
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Child ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            }
        }
    }
}

/// `REC_PARAM_<UPPER_SNAKE>` key for a parameter name.
fn param_env_key(name: &str) -> String {
    let upper: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("REC_PARAM_{upper}")
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Read a child stream to EOF, keeping at most [`OUTPUT_CAP`] bytes. The
/// stream is always fully drained so the child never blocks on a full pipe.
async fn drain_capped<R>(mut stream: R) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    let mut truncated = false;
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < OUTPUT_CAP {
                    let take = n.min(OUTPUT_CAP - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    let mut output = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        output.push_str(TRUNCATION_SENTINEL);
    }
    output
}

async fn collect(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
#[cfg(unix)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::action::{ActionKind, GitOptions};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn security() -> SecurityConfig {
        SecurityConfig {
            allowed_script_paths: Vec::new(),
            global_env: Default::default(),
            script_timeout: 300,
        }
    }

    fn runner(security: SecurityConfig) -> ScriptRunner {
        let sources = Arc::new(GitSourceManager::new(
            std::env::temp_dir().join("rec-test-sources"),
        ));
        ScriptRunner::new(security, sources)
    }

    fn local_action(id: &str, script: &Path) -> Action {
        Action {
            id: id.to_string(),
            name: None,
            kind: ActionKind::Script,
            trigger_event_type: "alert.created".to_string(),
            source: SourceType::Local,
            script_path: Some(script.to_path_buf()),
            http: None,
            parameters: Default::default(),
            parameter_definitions: Vec::new(),
            timeout_seconds: 30,
            env: Default::default(),
            git_options: None,
        }
    }

    #[tokio::test]
    async fn success_with_rendered_parameter_env() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "handle.sh",
            "#!/bin/sh\necho \"host=$REC_PARAM_HOST\"\n",
        );

        let mut params = BTreeMap::new();
        params.insert("host".to_string(), "prod-db-01".to_string());

        let result = runner(security())
            .run(
                "queue-123",
                &local_action("handle_alert", &script),
                &params,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("host=prod-db-01"));
        assert!(result.completed_at.is_some());
        assert!(result.failed_at.is_none());
    }

    #[tokio::test]
    async fn failure_captures_stderr_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "fail.sh",
            "#!/bin/sh\necho 'Error message' >&2\nexit 1\n",
        );

        let result = runner(security())
            .run(
                "queue-456",
                &local_action("fail_alert", &script),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("Error message"));
        assert!(result.failed_at.is_some());
        assert!(result.completed_at.is_none());
    }

    #[tokio::test]
    async fn timeout_kills_and_marks_failed() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 30\n");

        let mut action = local_action("slow", &script);
        action.timeout_seconds = 1;

        let start = Instant::now();
        let result = runner(security())
            .run(
                "queue-timeout",
                &action,
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!result.is_success());
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn action_timeout_is_capped_by_security_timeout() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 30\n");

        let mut sec = security();
        sec.script_timeout = 1;
        let mut action = local_action("slow", &script);
        action.timeout_seconds = 600;

        let start = Instant::now();
        let result = runner(sec)
            .run(
                "queue-cap",
                &action,
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn cancellation_tears_down_the_child() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "slow.sh", "#!/bin/sh\nsleep 30\n");

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let result = runner(security())
            .run(
                "queue-cancel",
                &local_action("slow", &script),
                &BTreeMap::new(),
                &token,
            )
            .await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!result.is_success());
        assert!(result.stderr.contains("cancelled"));
    }

    #[tokio::test]
    async fn disallowed_path_is_rejected_before_spawn() {
        let allowed = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let script = write_script(elsewhere.path(), "evil.sh", "#!/bin/sh\necho pwned\n");

        let mut sec = security();
        sec.allowed_script_paths = vec![allowed.path().to_path_buf()];

        let result = runner(sec)
            .run(
                "queue-forbidden",
                &local_action("evil", &script),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("not allowed"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn allowed_root_admits_scripts_under_it() {
        let allowed = TempDir::new().unwrap();
        let script = write_script(allowed.path(), "ok.sh", "#!/bin/sh\necho fine\n");

        let mut sec = security();
        sec.allowed_script_paths = vec![allowed.path().to_path_buf()];

        let result = runner(sec)
            .run(
                "queue-allowed",
                &local_action("ok", &script),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn missing_script_fails_without_spawning() {
        let result = runner(security())
            .run(
                "queue-missing",
                &local_action("gone", Path::new("/nonexistent/script.sh")),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.is_success());
        assert!(result.stderr.contains("script not found"));
    }

    #[tokio::test]
    async fn sensitive_env_is_scrubbed_and_global_env_injected() {
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "env.sh",
            "#!/bin/sh\necho \"key=[$REC_API_KEY] region=[$DEPLOY_REGION]\"\n",
        );

        let mut sec = security();
        sec.global_env
            .insert("DEPLOY_REGION".to_string(), "eu-west-1".to_string());

        let result = temp_env::async_with_vars(
            [("REC_API_KEY", Some("super-secret"))],
            runner(sec).run(
                "queue-env",
                &local_action("env_check", &script),
                &BTreeMap::new(),
                &CancellationToken::new(),
            ),
        )
        .await;

        assert!(result.is_success());
        assert!(result.stdout.contains("key=[]"));
        assert!(result.stdout.contains("region=[eu-west-1]"));
    }

    #[tokio::test]
    async fn large_output_is_bounded() {
        let dir = TempDir::new().unwrap();
        // ~1 MiB of output, an order of magnitude over the cap
        let script = write_script(
            dir.path(),
            "noisy.sh",
            "#!/bin/sh\ni=0\nwhile [ $i -lt 16384 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; i=$((i+1)); done\n",
        );

        let result = runner(security())
            .run(
                "queue-noisy",
                &local_action("noisy", &script),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success());
        assert!(result.stdout.len() <= OUTPUT_CAP + TRUNCATION_SENTINEL.len());
        assert!(result.stdout.ends_with(TRUNCATION_SENTINEL));
    }

    #[tokio::test]
    async fn git_sourced_script_runs_under_read_lock() {
        use git2::{Repository, RepositoryInitOptions, Signature};

        let origin_dir = TempDir::new().unwrap();
        let mut init = RepositoryInitOptions::new();
        init.initial_head("main");
        let origin = Repository::init_opts(origin_dir.path(), &init).unwrap();
        write_script(
            origin_dir.path(),
            "restart.sh",
            "#!/bin/sh\necho 'restarted from repo'\n",
        );
        let mut index = origin.index().unwrap();
        index.add_path(Path::new("restart.sh")).unwrap();
        let tree = origin.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@local").unwrap();
        origin
            .commit(Some("HEAD"), &sig, &sig, "add script", &tree, &[])
            .unwrap();

        let checkouts = TempDir::new().unwrap();
        let sources = Arc::new(GitSourceManager::new(checkouts.path()));
        let url = origin_dir.path().to_str().unwrap().to_string();
        sources
            .download(&GitOptions {
                url: url.clone(),
                branch: Some("main".into()),
                private_key_path: None,
                poll_interval_seconds: Some(0),
            })
            .await
            .unwrap();

        let runner = ScriptRunner::new(security(), sources);
        let mut action = local_action("restart_service", Path::new("restart.sh"));
        action.source = SourceType::Git;
        action.git_options = Some(GitOptions {
            url,
            branch: Some("main".into()),
            private_key_path: None,
            poll_interval_seconds: Some(0),
        });

        let result = runner
            .run(
                "queue-git",
                &action,
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_success(), "stderr: {}", result.stderr);
        assert!(result.stdout.contains("restarted from repo"));
    }

    #[test]
    fn param_env_keys_upper_snake() {
        assert_eq!(param_env_key("host"), "REC_PARAM_HOST");
        assert_eq!(param_env_key("service-name"), "REC_PARAM_SERVICE_NAME");
        assert_eq!(param_env_key("dotted.name"), "REC_PARAM_DOTTED_NAME");
    }
}
