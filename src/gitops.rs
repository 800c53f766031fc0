//! GitOps: desired state kept in a git repository
//!
//! Pull direction ([`GitSyncer`]): every `auto_sync` source is polled on its
//! own timer. A new revision is read, applied wholesale through the engine,
//! and only then recorded as the source's applied revision.
//!
//! Push direction ([`GitCommitter`]): after every engine mutation the current
//! desired state is committed to each `auto_commit` source.

use crate::config::GitOpsConfig;
use crate::db::Database;
use crate::engine::Engine;
use crate::model::{now_rfc3339, DesiredState, DesiredStateDiff, GitSource, SyncDirection};
use crate::secrets::CredentialVault;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PULL_ACTOR: &str = "gitops";
const PUSH_ACTOR: &str = "routesync";

/// Where a source lives, with its credential already decrypted
#[derive(Clone)]
pub struct RepoLocation {
    pub source_id: String,
    pub url: String,
    pub branch: String,
    pub credential: Option<String>,
}

impl std::fmt::Debug for RepoLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoLocation")
            .field("source_id", &self.source_id)
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Version-control remote
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Fetch the branch and return its head revision
    async fn fetch_revision(&self, repo: &RepoLocation) -> Result<String>;

    /// Contents of `path` at `revision`, `None` when the file does not exist
    async fn read_file(&self, repo: &RepoLocation, revision: &str, path: &str) -> Result<Option<String>>;

    /// Commit `content` to `path` on the branch and push.
    /// Returns the new revision, or `None` when the content was unchanged.
    async fn push_file(
        &self,
        repo: &RepoLocation,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<Option<String>>;
}

fn repo_location(vault: &CredentialVault, source: &GitSource) -> Result<RepoLocation> {
    let credential = match &source.credential {
        Some(stored) => Some(
            vault
                .decrypt(stored)
                .with_context(|| format!("Failed to decrypt credential of source '{}'", source.name))?,
        ),
        None => None,
    };

    Ok(RepoLocation {
        source_id: source.id.clone(),
        url: source.url.clone(),
        branch: source.branch.clone(),
        credential,
    })
}

// ==================== Pull ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged { revision: String },
    Applied { revision: String, diff: DesiredStateDiff },
}

pub struct GitSyncer {
    engine: Arc<Engine>,
    db: Arc<Database>,
    vcs: Arc<dyn VersionControl>,
    vault: Arc<CredentialVault>,
    export_file: String,
}

impl GitSyncer {
    pub fn new(
        engine: Arc<Engine>,
        vcs: Arc<dyn VersionControl>,
        vault: Arc<CredentialVault>,
        config: &GitOpsConfig,
    ) -> Self {
        let db = engine.db().clone();
        Self {
            engine,
            db,
            vcs,
            vault,
            export_file: config.export_file.clone(),
        }
    }

    /// One pull of `source_id`. Failures are recorded on the source and
    /// leave its applied revision untouched.
    pub async fn sync_once(&self, source_id: &str) -> Result<SyncOutcome> {
        let source = self
            .db
            .get_git_source(source_id)?
            .ok_or_else(|| anyhow::anyhow!("Git source '{}' not found", source_id))?;

        match self.pull(&source).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(record_err) = self.db.record_sync_failure(&source.id, &e.to_string(), &now_rfc3339()) {
                    error!(source = %source.name, error = %record_err, "Failed to record sync failure");
                }
                Err(e)
            }
        }
    }

    async fn pull(&self, source: &GitSource) -> Result<SyncOutcome> {
        let repo = repo_location(&self.vault, source)?;
        let revision = self.vcs.fetch_revision(&repo).await?;

        if source.last_applied_revision.as_deref() == Some(revision.as_str()) {
            debug!(source = %source.name, revision = %revision, "Revision already applied");
            return Ok(SyncOutcome::Unchanged { revision });
        }

        let content = self
            .vcs
            .read_file(&repo, &revision, &self.export_file)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{} not found at revision {}", self.export_file, revision))?;
        let state = DesiredState::from_json(&content)
            .with_context(|| format!("Invalid {} at revision {}", self.export_file, revision))?;

        let diff = self.engine.apply_desired_state_replace(state.clone()).await?;

        self.db
            .record_sync_success(&source.id, &revision, &diff, PULL_ACTOR, SyncDirection::Pull, &now_rfc3339())?;

        if let Err(e) = self.engine.snapshots().snapshot_export(&state).await {
            warn!(source = %source.name, error = %e, "Failed to snapshot applied export");
        }

        info!(
            source = %source.name,
            revision = %revision,
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Applied desired state from git"
        );
        Ok(SyncOutcome::Applied { revision, diff })
    }

    /// Run one timer per `auto_sync` source until shutdown.
    ///
    /// Sources are re-listed every `rescan` so new ones start without a restart.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>, rescan: Duration) {
        let mut running: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            match self.db.list_git_sources() {
                Ok(sources) => {
                    for source in sources.into_iter().filter(|s| s.auto_sync) {
                        let alive = running.get(&source.id).map(|h| !h.is_finished()).unwrap_or(false);
                        if alive {
                            continue;
                        }
                        info!(source = %source.name, interval = source.sync_interval_secs, "Starting GitOps sync timer");
                        let handle = tokio::spawn(self.clone().source_loop(source.id.clone(), shutdown_rx.clone()));
                        running.insert(source.id, handle);
                    }
                }
                Err(e) => error!(error = %e, "Failed to list git sources"),
            }

            tokio::select! {
                _ = tokio::time::sleep(rescan) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for (source_id, handle) in running {
            if let Err(e) = handle.await {
                error!(source_id = %source_id, error = %e, "GitOps sync task failed");
            }
        }
        info!("GitOps syncer stopped");
    }

    async fn source_loop(self: Arc<Self>, source_id: String, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let source = match self.db.get_git_source(&source_id) {
                Ok(Some(source)) if source.auto_sync => source,
                Ok(_) => {
                    info!(source_id = %source_id, "Git source removed or auto-sync disabled");
                    return;
                }
                Err(e) => {
                    error!(source_id = %source_id, error = %e, "Failed to load git source");
                    return;
                }
            };

            match self.sync_once(&source.id).await {
                Ok(SyncOutcome::Applied { revision, .. }) => {
                    debug!(source = %source.name, revision = %revision, "Sync applied")
                }
                Ok(SyncOutcome::Unchanged { .. }) => {}
                Err(e) => error!(source = %source.name, error = %e, "GitOps sync failed"),
            }

            let interval = Duration::from_secs(source.sync_interval_secs.max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

// ==================== Push ====================

pub struct GitCommitter {
    db: Arc<Database>,
    vcs: Arc<dyn VersionControl>,
    vault: Arc<CredentialVault>,
    export_file: String,
}

impl GitCommitter {
    pub fn new(db: Arc<Database>, vcs: Arc<dyn VersionControl>, vault: Arc<CredentialVault>, config: &GitOpsConfig) -> Self {
        Self {
            db,
            vcs,
            vault,
            export_file: config.export_file.clone(),
        }
    }

    /// Current desired state, without records owned by discovery
    pub fn export(&self) -> Result<DesiredState> {
        let discovered: HashSet<String> = self.db.auto_managed_proxy_ids()?.into_iter().collect();
        let proxies = self
            .db
            .list_proxies()?
            .iter()
            .filter(|p| !discovered.contains(&p.id))
            .map(|p| p.exported())
            .collect();

        Ok(DesiredState {
            proxies,
            middleware: self.db.list_middleware()?,
            ..Default::default()
        })
    }

    /// Commit the current desired state to `source`; `None` when nothing changed
    pub async fn push_current(&self, source: &GitSource) -> Result<Option<String>> {
        let repo = repo_location(&self.vault, source)?;
        let state = self.export()?;

        let previous = match self.vcs.fetch_revision(&repo).await {
            Ok(revision) => self
                .vcs
                .read_file(&repo, &revision, &self.export_file)
                .await?
                .and_then(|content| DesiredState::from_json(&content).ok())
                .unwrap_or_default(),
            Err(e) => {
                debug!(source = %source.name, error = %e, "No remote revision yet");
                DesiredState::default()
            }
        };
        let diff = DesiredStateDiff::compute(&previous.proxies, &state.proxies);

        let message = format!(
            "routesync: {} added, {} removed, {} changed",
            diff.added.len(),
            diff.removed.len(),
            diff.changed.len()
        );
        let content = state.to_json_pretty()?;
        let revision = self.vcs.push_file(&repo, &self.export_file, &content, &message).await?;

        if let Some(revision) = &revision {
            self.db.record_sync_success(
                &source.id,
                revision,
                &diff,
                PUSH_ACTOR,
                SyncDirection::Push,
                &now_rfc3339(),
            )?;
            info!(source = %source.name, revision = %revision, "Pushed desired state");
        }
        Ok(revision)
    }

    /// Push to every `auto_commit` source
    pub async fn push_all(&self) -> Result<usize> {
        let mut pushed = 0;
        for source in self.db.list_git_sources()?.into_iter().filter(|s| s.auto_commit) {
            match self.push_current(&source).await {
                Ok(Some(_)) => pushed += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(source = %source.name, error = %e, "GitOps push failed");
                    if let Err(record_err) = self.db.record_sync_failure(&source.id, &e.to_string(), &now_rfc3339()) {
                        error!(source = %source.name, error = %record_err, "Failed to record push failure");
                    }
                }
            }
        }
        Ok(pushed)
    }

    /// Push after every engine mutation; bursts coalesce into one push
    pub async fn run(&self, mut changes: watch::Receiver<u64>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Err(e) = self.push_all().await {
                        error!(error = %e, "GitOps push pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("GitOps committer stopped");
    }
}

// ==================== Git CLI ====================

/// [`VersionControl`] backed by the `git` binary.
///
/// Each source gets a working copy under `<work_dir>/<source id>` without a
/// configured remote; the authenticated URL is passed per command so the
/// credential never lands in `.git/config`.
pub struct GitCli {
    work_dir: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitCli {
    pub fn new(config: &GitOpsConfig) -> Self {
        let (author_name, author_email) = parse_author(&config.commit_author);
        Self {
            work_dir: config.work_dir.clone(),
            author_name,
            author_email,
        }
    }

    fn checkout_dir(&self, repo: &RepoLocation) -> PathBuf {
        self.work_dir.join(&repo.source_id)
    }

    async fn ensure_repo(&self, repo: &RepoLocation) -> Result<PathBuf> {
        let dir = self.checkout_dir(repo);
        if !dir.join(".git").exists() {
            tokio::fs::create_dir_all(&dir).await?;
            run_git(&dir, &["init", "--quiet"], repo).await?;
            debug!(path = %dir.display(), "Initialized GitOps working copy");
        }
        Ok(dir)
    }

    async fn fetch(&self, dir: &Path, repo: &RepoLocation) -> Result<String> {
        let url = authenticated_url(&repo.url, repo.credential.as_deref())?;
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", repo.branch);
        run_git(dir, &["fetch", "--quiet", &url, &refspec], repo).await?;

        let tracking = format!("refs/remotes/origin/{}", repo.branch);
        run_git(dir, &["rev-parse", &tracking], repo).await
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn fetch_revision(&self, repo: &RepoLocation) -> Result<String> {
        let dir = self.ensure_repo(repo).await?;
        self.fetch(&dir, repo).await
    }

    async fn read_file(&self, repo: &RepoLocation, revision: &str, path: &str) -> Result<Option<String>> {
        let dir = self.ensure_repo(repo).await?;
        let object = format!("{}:{}", revision, path);

        let exists = Command::new("git")
            .args(["cat-file", "-e", &object])
            .current_dir(&dir)
            .status()
            .await
            .context("Failed to run git")?;
        if !exists.success() {
            return Ok(None);
        }

        run_git(&dir, &["show", &object], repo).await.map(Some)
    }

    async fn push_file(&self, repo: &RepoLocation, path: &str, content: &str, message: &str) -> Result<Option<String>> {
        let dir = self.ensure_repo(repo).await?;
        let base = self.fetch(&dir, repo).await?;

        run_git(&dir, &["checkout", "--quiet", "-B", &repo.branch, &base], repo).await?;

        let file = dir.join(path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, content).await?;
        run_git(&dir, &["add", "--", path], repo).await?;

        let staged = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(&dir)
            .status()
            .await
            .context("Failed to run git")?;
        if staged.success() {
            return Ok(None);
        }

        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        run_git(&dir, &["-c", &name, "-c", &email, "commit", "--quiet", "-m", message], repo).await?;

        let url = authenticated_url(&repo.url, repo.credential.as_deref())?;
        let target = format!("HEAD:refs/heads/{}", repo.branch);
        run_git(&dir, &["push", "--quiet", &url, &target], repo).await?;

        run_git(&dir, &["rev-parse", "HEAD"], repo).await.map(Some)
    }
}

/// Run git in `dir`, returning trimmed stdout. Errors never contain the credential.
async fn run_git(dir: &Path, args: &[&str], repo: &RepoLocation) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .context("Failed to run git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let command = args.first().copied().unwrap_or("git");
        anyhow::bail!(
            "git {} failed: {}",
            command,
            redact(stderr.trim(), repo.credential.as_deref())
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Embed the credential into an https remote.
///
/// `user:password` is used as given; a bare token becomes the password of
/// `x-access-token`. Other schemes are returned unchanged.
pub fn authenticated_url(remote: &str, credential: Option<&str>) -> Result<String> {
    let Some(credential) = credential.filter(|c| !c.is_empty()) else {
        return Ok(remote.to_string());
    };

    let mut url = match url::Url::parse(remote) {
        Ok(url) if url.scheme() == "https" || url.scheme() == "http" => url,
        _ => return Ok(remote.to_string()),
    };

    let (user, password) = match credential.split_once(':') {
        Some((user, password)) => (user, password),
        None => ("x-access-token", credential),
    };

    url.set_username(user)
        .map_err(|_| anyhow::anyhow!("Cannot set credentials on {}", remote))?;
    url.set_password(Some(password))
        .map_err(|_| anyhow::anyhow!("Cannot set credentials on {}", remote))?;
    Ok(url.to_string())
}

/// Replace every occurrence of the credential (and its password part)
pub fn redact(message: &str, credential: Option<&str>) -> String {
    let Some(credential) = credential.filter(|c| !c.is_empty()) else {
        return message.to_string();
    };

    let mut redacted = message.replace(credential, "***");
    if let Some((_, password)) = credential.split_once(':') {
        if !password.is_empty() {
            redacted = redacted.replace(password, "***");
        }
    }
    redacted
}

fn parse_author(author: &str) -> (String, String) {
    match author.split_once('<') {
        Some((name, rest)) => (
            name.trim().to_string(),
            rest.trim_end_matches('>').trim().to_string(),
        ),
        None => (author.trim().to_string(), "routesync@localhost".to_string()),
    }
}
