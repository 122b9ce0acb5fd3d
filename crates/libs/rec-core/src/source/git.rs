//! Git-backed script repositories.
//!
//! Each configured repository gets one local checkout, owned exclusively by
//! this process, under the manager's root directory. The checkout directory
//! name is derived from a SHA-256 digest of the normalized URL so distinct
//! remotes never collide.
//!
//! Coordination: every repository carries a readers-writer lock. Script
//! executions hold the read side for the whole child lifetime; a pull takes
//! the write side, so no execution ever sees a half-updated tree. The tokio
//! lock is write-preferring, which keeps back-to-back executions from
//! starving a pending pull.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::action::GitOptions;

/// Default branch when the action config leaves it unset.
const DEFAULT_BRANCH: &str = "main";

/// Default minimum seconds between pulls of one repository.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Cadence of the background pull task.
const PERIODIC_PULL_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory handle for one cloned repository.
#[derive(Debug)]
pub struct GitRepo {
    url: String,
    dir: PathBuf,
    branch: String,
    private_key_path: Option<PathBuf>,
    poll_interval: Duration,
    lock: Arc<RwLock<()>>,
    last_pulled_at: Mutex<Option<Instant>>,
}

impl GitRepo {
    /// Local checkout directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn pull_due(&self) -> bool {
        let last = self.last_pulled_at.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) => at.elapsed() >= self.poll_interval,
            None => true,
        }
    }

    fn mark_pulled(&self) {
        let mut last = self.last_pulled_at.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }
}

/// Owner of every git checkout the agent uses.
///
/// Cached handles are stable for the process lifetime; `download` on a known
/// URL returns the existing handle.
pub struct GitSourceManager {
    root: PathBuf,
    repos: RwLock<HashMap<String, Arc<GitRepo>>>,
}

impl GitSourceManager {
    /// `root` is the directory all checkouts live under; created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// Clone the repository if this is the first time the URL is seen,
    /// otherwise return the cached handle.
    ///
    /// A directory left over from a previous run that no longer opens as a
    /// repository is removed and cloned fresh. A configured private key that
    /// does not exist on disk fails here with an I/O error.
    pub async fn download(&self, opts: &GitOptions) -> Result<Arc<GitRepo>> {
        let url = normalize_url(&opts.url);

        if let Some(repo) = self.repos.read().await.get(&url) {
            return Ok(Arc::clone(repo));
        }

        let mut repos = self.repos.write().await;
        // Second check: another task may have cloned while we waited.
        if let Some(repo) = repos.get(&url) {
            return Ok(Arc::clone(repo));
        }

        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let dir = self.root.join(checkout_dir_name(&url));
        let key = opts.private_key_path.clone();

        {
            let url = url.clone();
            let branch = branch.clone();
            let dir = dir.clone();
            let key = key.clone();
            tokio::task::spawn_blocking(move || ensure_checkout(&url, &branch, &dir, key.as_deref()))
                .await
                .map_err(|err| Error::Io(std::io::Error::other(err)))??;
        }
        info!(url = %url, dir = %dir.display(), "Git repository ready");

        let repo = Arc::new(GitRepo {
            url: url.clone(),
            dir,
            branch,
            private_key_path: key,
            poll_interval: opts
                .poll_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            lock: Arc::new(RwLock::new(())),
            last_pulled_at: Mutex::new(Some(Instant::now())),
        });
        repos.insert(url, Arc::clone(&repo));
        Ok(repo)
    }

    /// Absolute path of `relative` inside the repository checkout.
    ///
    /// The resolved path must stay inside the checkout; traversal attempts
    /// and dangling paths are rejected.
    pub async fn script_path(&self, url: &str, relative: &Path) -> Result<PathBuf> {
        let repo = self.get(url).await?;
        let candidate = repo.dir.join(relative);
        let resolved = candidate
            .canonicalize()
            .map_err(|_| Error::ScriptNotFound(candidate.display().to_string()))?;
        let root = repo.dir.canonicalize()?;
        if !resolved.starts_with(&root) {
            return Err(Error::ScriptPathNotAllowed(relative.display().to_string()));
        }
        Ok(resolved)
    }

    /// Acquire the repository's read lock. The Script Runner holds this for
    /// the entire child lifetime, which blocks pulls of the same repo.
    pub async fn read_lock(&self, url: &str) -> Result<OwnedRwLockReadGuard<()>> {
        let repo = self.get(url).await?;
        Ok(Arc::clone(&repo.lock).read_owned().await)
    }

    /// Fast-forward the checkout to the remote branch head.
    ///
    /// Skipped (returning `false`) while the per-repo poll interval has not
    /// elapsed. Takes the repository's write lock, so it waits for active
    /// executions and blocks new ones until done. "Already up to date" is
    /// success.
    pub async fn pull(&self, repo: &Arc<GitRepo>) -> Result<bool> {
        if !repo.pull_due() {
            debug!(url = %repo.url, "Pull skipped, within poll interval");
            return Ok(false);
        }

        let _write = repo.lock.write().await;
        let dir = repo.dir.clone();
        let branch = repo.branch.clone();
        let key = repo.private_key_path.clone();
        let outcome = tokio::task::spawn_blocking(move || ff_pull(&dir, &branch, key.as_deref()))
            .await
            .map_err(|err| Error::Io(std::io::Error::other(err)))?;

        match outcome {
            Ok(()) => {
                repo.mark_pulled();
                metrics::git_pull("ok");
                debug!(url = %repo.url, "Pull complete");
                Ok(true)
            }
            Err(err) => {
                metrics::git_pull("error");
                Err(err)
            }
        }
    }

    /// Pull every known repository; failures are logged, never propagated.
    pub async fn pull_all(&self) {
        let repos: Vec<Arc<GitRepo>> = self.repos.read().await.values().cloned().collect();
        for repo in repos {
            if let Err(err) = self.pull(&repo).await {
                warn!(url = %repo.url, error = %err, "Git pull failed");
            }
        }
    }

    /// Background task pulling all repositories until cancelled.
    pub fn start_periodic_pull(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(PERIODIC_PULL_INTERVAL) => manager.pull_all().await,
                }
            }
            debug!("Periodic git pull stopped");
        })
    }

    async fn get(&self, url: &str) -> Result<Arc<GitRepo>> {
        let url = normalize_url(url);
        self.repos
            .read()
            .await
            .get(&url)
            .cloned()
            .ok_or(Error::RepositoryNotFound(url))
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Deterministic, collision-resistant directory name for a URL.
fn checkout_dir_name(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let name: String = url
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect();
    if name.is_empty() {
        digest[..16].to_string()
    } else {
        format!("{}-{}", name, &digest[..12])
    }
}

fn auth_callbacks(key: Option<&Path>) -> Result<RemoteCallbacks<'static>> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(key) = key {
        if !key.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("private key not found: {}", key.display()),
            )));
        }
        let key = key.to_path_buf();
        callbacks.credentials(move |_url, username, _allowed| {
            Cred::ssh_key(username.unwrap_or("git"), None, &key, None)
        });
    }
    Ok(callbacks)
}

fn ensure_checkout(url: &str, branch: &str, dir: &Path, key: Option<&Path>) -> Result<()> {
    if dir.exists() {
        if Repository::open(dir).is_ok() {
            return Ok(());
        }
        warn!(dir = %dir.display(), "Directory is not a valid clone, removing");
        std::fs::remove_dir_all(dir)?;
    }
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(auth_callbacks(key)?);
    RepoBuilder::new()
        .fetch_options(fetch)
        .branch(branch)
        .clone(url, dir)?;
    Ok(())
}

/// Fetch and fast-forward `branch`. Anything but a fast-forward (or
/// up-to-date) outcome is an error; the checkout is never rewound.
fn ff_pull(dir: &Path, branch: &str, key: Option<&Path>) -> Result<()> {
    let repo = Repository::open(dir)?;
    let mut remote = repo.find_remote("origin")?;
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(auth_callbacks(key)?);
    remote.fetch(&[branch], Some(&mut fetch), None)?;

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_up_to_date() {
        return Ok(());
    }
    if analysis.is_fast_forward() {
        let refname = format!("refs/heads/{branch}");
        let mut reference = repo.find_reference(&refname)?;
        reference.set_target(fetch_commit.id(), "fast-forward")?;
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        return Ok(());
    }
    Err(Error::Git2(git2::Error::from_str(
        "remote branch moved non-fast-forward",
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature};
    use tempfile::TempDir;

    fn init_origin(dir: &Path) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(dir, &opts).expect("init origin")
    }

    fn commit_file(repo: &Repository, name: &str, content: &str, message: &str) {
        let workdir = repo.workdir().unwrap();
        std::fs::write(workdir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@local").unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
    }

    fn opts(url: &str) -> GitOptions {
        GitOptions {
            url: url.to_string(),
            branch: Some("main".to_string()),
            private_key_path: None,
            poll_interval_seconds: Some(0),
        }
    }

    #[tokio::test]
    async fn download_is_idempotent() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "#!/bin/sh\necho hi\n", "initial");

        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let url = origin_dir.path().to_str().unwrap();

        let first = manager.download(&opts(url)).await.unwrap();
        let second = manager.download(&opts(url)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.dir().join("run.sh").exists());
    }

    #[tokio::test]
    async fn script_path_resolves_and_rejects_traversal() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "#!/bin/sh\necho hi\n", "initial");

        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let url = origin_dir.path().to_str().unwrap();
        manager.download(&opts(url)).await.unwrap();

        let resolved = manager
            .script_path(url, Path::new("run.sh"))
            .await
            .unwrap();
        assert!(resolved.ends_with("run.sh"));

        let err = manager
            .script_path(url, Path::new("../../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ScriptNotFound(_) | Error::ScriptPathNotAllowed(_)
        ));

        let err = manager
            .script_path(url, Path::new("missing.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_url_is_repository_not_found() {
        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let err = manager
            .script_path("/nowhere/repo", Path::new("run.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryNotFound(_)));
    }

    #[tokio::test]
    async fn pull_fast_forwards_new_commits() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "v1", "initial");

        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let url = origin_dir.path().to_str().unwrap();
        let repo = manager.download(&opts(url)).await.unwrap();

        commit_file(&origin, "extra.sh", "v2", "second");
        assert!(manager.pull(&repo).await.unwrap());
        assert!(repo.dir().join("extra.sh").exists());
    }

    #[tokio::test]
    async fn pull_respects_poll_interval() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "v1", "initial");

        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let url = origin_dir.path().to_str().unwrap();

        let mut options = opts(url);
        options.poll_interval_seconds = Some(3_600);
        let repo = manager.download(&options).await.unwrap();

        // Fresh clone counts as pulled; within the interval nothing happens.
        assert!(!manager.pull(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn pull_waits_for_readers() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "v1", "initial");

        let root = TempDir::new().unwrap();
        let manager = Arc::new(GitSourceManager::new(root.path()));
        let url = origin_dir.path().to_str().unwrap().to_string();
        let repo = manager.download(&opts(&url)).await.unwrap();
        commit_file(&origin, "extra.sh", "v2", "second");

        let guard = manager.read_lock(&url).await.unwrap();
        let pull_task = {
            let manager = Arc::clone(&manager);
            let repo = Arc::clone(&repo);
            tokio::spawn(async move { manager.pull(&repo).await })
        };

        // The pull cannot finish while the read guard is held.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pull_task.is_finished());

        drop(guard);
        assert!(pull_task.await.unwrap().unwrap());
        assert!(repo.dir().join("extra.sh").exists());
    }

    #[tokio::test]
    async fn invalid_checkout_dir_is_recloned() {
        let origin_dir = TempDir::new().unwrap();
        let origin = init_origin(origin_dir.path());
        commit_file(&origin, "run.sh", "v1", "initial");

        let root = TempDir::new().unwrap();
        let url = origin_dir.path().to_str().unwrap();

        // Pre-create junk where the checkout should land.
        let junk = root.path().join(checkout_dir_name(&normalize_url(url)));
        std::fs::create_dir_all(&junk).unwrap();
        std::fs::write(junk.join("garbage"), "not a repo").unwrap();

        let manager = GitSourceManager::new(root.path());
        let repo = manager.download(&opts(url)).await.unwrap();
        assert!(repo.dir().join("run.sh").exists());
        assert!(!repo.dir().join("garbage").exists());
    }

    #[tokio::test]
    async fn missing_private_key_fails_download() {
        let origin_dir = TempDir::new().unwrap();
        init_origin(origin_dir.path());

        let root = TempDir::new().unwrap();
        let manager = GitSourceManager::new(root.path());
        let mut options = opts(origin_dir.path().to_str().unwrap());
        options.private_key_path = Some(PathBuf::from("/nonexistent/id_ed25519"));

        let err = manager.download(&options).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn dir_names_are_stable_and_distinct() {
        let a = checkout_dir_name("git@github.com:acme/runbooks.git");
        let b = checkout_dir_name("git@github.com:acme/other.git");
        assert_eq!(a, checkout_dir_name("git@github.com:acme/runbooks.git"));
        assert_ne!(a, b);
        assert!(a.starts_with("runbooks-"));
    }
}
