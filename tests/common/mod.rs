//! Shared fixtures for the integration tests
#![allow(dead_code)]

use routesync::config::RemoteConfig;
use routesync::db::Database;
use routesync::engine::Engine;
use routesync::live::{tracked_proxy_id, InMemoryLiveConfig};
use routesync::model::{DomainEntry, ProxyRecord};
use routesync::snapshot::SnapshotManager;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub db: Arc<Database>,
    pub live: Arc<InMemoryLiveConfig>,
    pub snapshots: Arc<SnapshotManager>,
    pub engine: Arc<Engine>,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path().join("routesync.db")).unwrap());
    let live = Arc::new(InMemoryLiveConfig::new("srv0"));
    let snapshots = Arc::new(SnapshotManager::new(dir.path().join("snapshots"), db.clone()).unwrap());
    let engine = Arc::new(Engine::new(
        db.clone(),
        live.clone(),
        snapshots.clone(),
        &RemoteConfig::default(),
    ));

    Harness {
        dir,
        db,
        live,
        snapshots,
        engine,
    }
}

pub fn proxy(name: &str) -> ProxyRecord {
    ProxyRecord::new(
        name,
        vec![DomainEntry::new(&format!("{}.example.com", name))],
        &format!("http://{}:8080", name),
    )
}

/// Proxy id of every live route, `foreign` for routes not managed here
pub fn live_ids(live: &InMemoryLiveConfig) -> Vec<String> {
    live.routes()
        .iter()
        .map(|r| tracked_proxy_id(r).unwrap_or("foreign").to_string())
        .collect()
}
