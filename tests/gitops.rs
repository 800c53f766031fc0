//! Integration tests for GitOps pull and push against a scripted remote

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{harness, live_ids, proxy, Harness};
use parking_lot::Mutex;
use routesync::config::GitOpsConfig;
use routesync::gitops::{GitCommitter, GitSyncer, RepoLocation, SyncOutcome, VersionControl};
use routesync::model::{
    now_rfc3339, DesiredState, DiscoveredService, GitSource, ProxyStatus, ServiceStatus, SnapshotKind, SourceKind,
    SyncDirection,
};
use routesync::secrets::CredentialVault;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct ScriptedRepo {
    head: Mutex<String>,
    files: Mutex<HashMap<(String, String), String>>,
    pushes: Mutex<Vec<(String, String, String)>>,
    credentials_seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedRepo {
    fn publish(&self, revision: &str, path: &str, content: &str) {
        self.files
            .lock()
            .insert((revision.to_string(), path.to_string()), content.to_string());
        *self.head.lock() = revision.to_string();
    }
}

#[async_trait]
impl VersionControl for ScriptedRepo {
    async fn fetch_revision(&self, repo: &RepoLocation) -> Result<String> {
        self.credentials_seen.lock().push(repo.credential.clone());
        let head = self.head.lock().clone();
        if head.is_empty() {
            anyhow::bail!("branch {} does not exist", repo.branch);
        }
        Ok(head)
    }

    async fn read_file(&self, _repo: &RepoLocation, revision: &str, path: &str) -> Result<Option<String>> {
        Ok(self
            .files
            .lock()
            .get(&(revision.to_string(), path.to_string()))
            .cloned())
    }

    async fn push_file(&self, _repo: &RepoLocation, path: &str, content: &str, message: &str) -> Result<Option<String>> {
        let head = self.head.lock().clone();
        let current = self.files.lock().get(&(head, path.to_string())).cloned();
        if current.as_deref() == Some(content) {
            return Ok(None);
        }

        let revision = format!("push-{}", self.pushes.lock().len() + 1);
        self.pushes
            .lock()
            .push((path.to_string(), content.to_string(), message.to_string()));
        self.publish(&revision, path, content);
        Ok(Some(revision))
    }
}

fn source(name: &str) -> GitSource {
    GitSource {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        url: format!("https://git.example.com/{}.git", name),
        branch: "main".to_string(),
        credential: None,
        auto_commit: false,
        auto_sync: true,
        sync_interval_secs: 60,
        last_applied_revision: None,
        last_sync_at: None,
        last_error: None,
        created_at: now_rfc3339(),
    }
}

fn syncer(h: &Harness, repo: Arc<ScriptedRepo>, vault: Arc<CredentialVault>) -> GitSyncer {
    GitSyncer::new(h.engine.clone(), repo, vault, &GitOpsConfig::default())
}

fn export_file() -> String {
    GitOpsConfig::default().export_file
}

fn export_of(names: &[&str]) -> (DesiredState, String) {
    let state = DesiredState {
        proxies: names.iter().map(|n| proxy(n)).collect(),
        ..Default::default()
    };
    let content = state.to_json_pretty().unwrap();
    (state, content)
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn test_pull_applies_new_revision() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let src = source("prod");
    h.db.save_git_source(&src).unwrap();

    let (state, content) = export_of(&["web", "api"]);
    repo.publish("rev-1", &export_file(), &content);

    let outcome = syncer(&h, repo, vault).sync_once(&src.id).await.unwrap();
    match outcome {
        SyncOutcome::Applied { revision, diff } => {
            assert_eq!(revision, "rev-1");
            assert_eq!(diff.added, vec!["api", "web"]);
        }
        other => panic!("expected applied, got {:?}", other),
    }

    let mut expected: Vec<String> = state.proxies.iter().map(|p| p.id.clone()).collect();
    expected.sort();
    let mut live = live_ids(&h.live);
    live.sort();
    assert_eq!(live, expected);

    let stored = h.db.get_git_source(&src.id).unwrap().unwrap();
    assert_eq!(stored.last_applied_revision.as_deref(), Some("rev-1"));
    assert_eq!(stored.last_error, None);

    let history = h.db.list_sync_history(&src.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].actor, "gitops");
    assert_eq!(history[0].direction, SyncDirection::Pull);

    assert_eq!(h.snapshots.list(SnapshotKind::Export, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_pull_same_revision_is_noop() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let src = source("prod");
    h.db.save_git_source(&src).unwrap();

    let (_, content) = export_of(&["web"]);
    repo.publish("rev-1", &export_file(), &content);

    let syncer = syncer(&h, repo, vault);
    syncer.sync_once(&src.id).await.unwrap();
    let writes = h.live.write_count();

    let outcome = syncer.sync_once(&src.id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Unchanged {
            revision: "rev-1".to_string()
        }
    );
    assert_eq!(h.live.write_count(), writes);
    assert_eq!(h.db.list_sync_history(&src.id, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_remote_write_leaves_revision_and_store_untouched() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let src = source("prod");
    h.db.save_git_source(&src).unwrap();

    h.engine.add_proxy(proxy("legacy")).await.unwrap();
    let before = h.db.list_proxies().unwrap();

    let (_, content) = export_of(&["web", "api"]);
    repo.publish("rev-2", &export_file(), &content);

    let syncer = syncer(&h, repo, vault);
    h.live.fail_next_writes(1);
    assert!(syncer.sync_once(&src.id).await.is_err());

    let stored = h.db.get_git_source(&src.id).unwrap().unwrap();
    assert_eq!(stored.last_applied_revision, None);
    assert!(stored.last_error.is_some());
    assert_eq!(h.db.list_proxies().unwrap(), before);
    assert!(h.db.list_sync_history(&src.id, 10).unwrap().is_empty());

    // the next tick retries the same revision
    let outcome = syncer.sync_once(&src.id).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Applied { ref revision, .. } if revision == "rev-2"));

    let stored = h.db.get_git_source(&src.id).unwrap().unwrap();
    assert_eq!(stored.last_applied_revision.as_deref(), Some("rev-2"));
    assert_eq!(stored.last_error, None);

    let names: Vec<String> = h.db.list_proxies().unwrap().into_iter().map(|p| p.name).collect();
    assert!(!names.contains(&"legacy".to_string()));
    assert_eq!(names.len(), 2);
}

#[tokio::test]
async fn test_invalid_export_is_recorded_as_failure() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let src = source("prod");
    h.db.save_git_source(&src).unwrap();

    repo.publish("rev-1", &export_file(), "{ not json");
    assert!(syncer(&h, repo.clone(), vault.clone()).sync_once(&src.id).await.is_err());

    repo.publish("rev-2", "other.json", "{}");
    assert!(syncer(&h, repo, vault).sync_once(&src.id).await.is_err());

    let stored = h.db.get_git_source(&src.id).unwrap().unwrap();
    assert_eq!(stored.last_applied_revision, None);
    assert!(stored.last_error.unwrap().contains("not found"));
    assert_eq!(h.live.write_count(), 0);
}

#[tokio::test]
async fn test_pull_passes_decrypted_credential() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let mut src = source("prod");
    src.credential = Some(vault.encrypt("ghp_secret").unwrap());
    h.db.save_git_source(&src).unwrap();

    let (_, content) = export_of(&[]);
    repo.publish("rev-1", &export_file(), &content);
    syncer(&h, repo.clone(), vault).sync_once(&src.id).await.unwrap();

    assert_eq!(*repo.credentials_seen.lock(), vec![Some("ghp_secret".to_string())]);
}

#[tokio::test]
async fn test_crashed_source_loop_is_restarted_and_shutdown_completes() {
    #[derive(Default)]
    struct Crashing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VersionControl for Crashing {
        async fn fetch_revision(&self, _repo: &RepoLocation) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("checkout corrupted");
        }
        async fn read_file(&self, _repo: &RepoLocation, _revision: &str, _path: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn push_file(&self, _repo: &RepoLocation, _path: &str, _content: &str, _message: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    let h = harness();
    let src = source("prod");
    h.db.save_git_source(&src).unwrap();

    let vcs = Arc::new(Crashing::default());
    let syncer = Arc::new(GitSyncer::new(
        h.engine.clone(),
        vcs.clone(),
        Arc::new(CredentialVault::generate()),
        &GitOpsConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(syncer.run(shutdown_rx, Duration::from_millis(20)));

    let restarted = tokio::time::timeout(Duration::from_secs(5), async {
        while vcs.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(restarted.is_ok());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test]
async fn test_push_exports_desired_state_without_discovered_records() {
    let h = harness();
    let repo = Arc::new(ScriptedRepo::default());
    let vault = Arc::new(CredentialVault::generate());
    let mut src = source("mirror");
    src.auto_sync = false;
    src.auto_commit = true;
    h.db.save_git_source(&src).unwrap();

    let web = h.engine.add_proxy(proxy("web")).await.unwrap();
    let discovered = h.engine.add_proxy(proxy("worker")).await.unwrap();
    h.db.save_discovered_service(&DiscoveredService {
        id: uuid::Uuid::new_v4().to_string(),
        source_kind: SourceKind::Container,
        source_id: "c1".to_string(),
        name: "worker".to_string(),
        domain: "worker.example.com".to_string(),
        upstream_url: "http://worker:8080".to_string(),
        auto_managed: true,
        linked_proxy_id: Some(discovered.id.clone()),
        template: None,
        last_seen: now_rfc3339(),
        status: ServiceStatus::Active,
        created_at: now_rfc3339(),
    })
    .unwrap();

    let committer = GitCommitter::new(h.db.clone(), repo.clone(), vault, &GitOpsConfig::default());
    assert_eq!(committer.push_all().await.unwrap(), 1);

    let pushes = repo.pushes.lock().clone();
    assert_eq!(pushes.len(), 1);
    let (path, content, message) = &pushes[0];
    assert_eq!(path, &export_file());
    assert_eq!(message, "routesync: 1 added, 0 removed, 0 changed");

    let exported = DesiredState::from_json(content).unwrap();
    assert_eq!(exported.proxies.len(), 1);
    assert_eq!(exported.proxies[0].id, web.id);
    assert_eq!(exported.proxies[0].route_index, None);
    assert_eq!(exported.proxies[0].status, ProxyStatus::Pending);

    let history = h.db.list_sync_history(&src.id, 10).unwrap();
    assert_eq!(history[0].direction, SyncDirection::Push);
    assert_eq!(history[0].actor, "routesync");

    // unchanged state pushes nothing
    assert_eq!(committer.push_all().await.unwrap(), 0);
    assert_eq!(repo.pushes.lock().len(), 1);
}

#[tokio::test]
async fn test_push_failure_is_recorded() {
    struct Offline;

    #[async_trait]
    impl VersionControl for Offline {
        async fn fetch_revision(&self, _repo: &RepoLocation) -> Result<String> {
            anyhow::bail!("connection refused")
        }
        async fn read_file(&self, _repo: &RepoLocation, _revision: &str, _path: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn push_file(&self, _repo: &RepoLocation, _path: &str, _content: &str, _message: &str) -> Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
    }

    let h = harness();
    let mut src = source("mirror");
    src.auto_sync = false;
    src.auto_commit = true;
    h.db.save_git_source(&src).unwrap();

    let committer = GitCommitter::new(
        h.db.clone(),
        Arc::new(Offline),
        Arc::new(CredentialVault::generate()),
        &GitOpsConfig::default(),
    );
    assert_eq!(committer.push_all().await.unwrap(), 0);

    let stored = h.db.get_git_source(&src.id).unwrap().unwrap();
    assert!(stored.last_error.unwrap().contains("connection refused"));
}
