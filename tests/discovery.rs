//! Integration tests for the discovery watcher with a scripted container source

mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{harness, live_ids, Harness};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use routesync::config::{DiscoveryConfig, RemovePolicy, TemplateConfig};
use routesync::discovery::{ContainerSource, DiscoveryWatcher, LifecycleAction, LifecycleEvent, Workload};
use routesync::model::{format_timestamp, Middleware, MiddlewareSpec, ProxyStatus, RateLimit, ServiceStatus, SourceKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct ScriptedSource {
    workloads: Mutex<Vec<Workload>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
}

impl ScriptedSource {
    fn set(&self, workloads: Vec<Workload>) {
        *self.workloads.lock() = workloads;
    }

    fn with_events(&self) -> mpsc::UnboundedSender<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl ContainerSource for ScriptedSource {
    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self.workloads.lock().clone())
    }

    async fn inspect(&self, kind: SourceKind, source_id: &str) -> Result<Option<Workload>> {
        Ok(self
            .workloads
            .lock()
            .iter()
            .find(|w| w.kind == kind && w.source_id == source_id)
            .cloned())
    }

    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>> {
        match self.events.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (Ok(event), rx)) }).boxed(),
            None => stream::pending().boxed(),
        }
    }
}

fn workload(id: &str, name: &str, domain: &str) -> Workload {
    Workload {
        kind: SourceKind::Container,
        source_id: id.to_string(),
        name: name.to_string(),
        labels: HashMap::from([
            ("routesync.enable".to_string(), "true".to_string()),
            ("routesync.domain".to_string(), domain.to_string()),
            ("routesync.port".to_string(), "8080".to_string()),
        ]),
        address: Some(format!("10.0.0.{}", id.len())),
        ports: vec![8080],
    }
}

fn watcher(h: &Harness, source: Arc<ScriptedSource>, config: DiscoveryConfig) -> DiscoveryWatcher {
    DiscoveryWatcher::new(h.engine.clone(), source, config)
}

fn enabled_config() -> DiscoveryConfig {
    DiscoveryConfig {
        enabled: true,
        ..Default::default()
    }
}

// ============================================================================
// Observation
// ============================================================================

#[tokio::test]
async fn test_scan_creates_linked_proxies() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    let mut plain = workload("c2", "worker", "worker.example.com");
    plain.labels.clear();
    source.set(vec![workload("c1", "web", "web.example.com"), plain]);

    let w = watcher(&h, source, enabled_config());
    assert_eq!(w.scan().await.unwrap(), 1);

    let service = h
        .db
        .get_discovered_service(SourceKind::Container, "c1")
        .unwrap()
        .unwrap();
    assert_eq!(service.status, ServiceStatus::Active);
    assert!(service.auto_managed);

    let proxy = h.db.get_proxy(service.linked_proxy_id.as_deref().unwrap()).unwrap().unwrap();
    assert_eq!(proxy.status, ProxyStatus::Active);
    assert_eq!(proxy.upstream.url, "http://10.0.0.2:8080");
    assert_eq!(proxy.domain_names(), vec!["web.example.com"]);
    assert_eq!(live_ids(&h.live), vec![proxy.id]);
}

#[tokio::test]
async fn test_rescan_without_changes_does_not_touch_remote() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source, enabled_config());
    w.scan().await.unwrap();
    let writes = h.live.write_count();

    w.scan().await.unwrap();
    assert_eq!(h.live.write_count(), writes);
}

#[tokio::test]
async fn test_label_change_updates_proxy_in_place() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source.clone(), enabled_config());
    w.scan().await.unwrap();

    source.set(vec![workload("c1", "web", "www.example.com")]);
    w.scan().await.unwrap();

    let proxies = h.db.list_proxies().unwrap();
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0].domain_names(), vec!["www.example.com"]);
    assert_eq!(proxies[0].route_index, Some(0));
}

#[tokio::test]
async fn test_template_applies_middleware() {
    let h = harness();
    let limit = Middleware::new(
        "default-limit",
        MiddlewareSpec::RateLimit(RateLimit {
            requests: 100,
            window_secs: 60,
            key: None,
        }),
    );
    h.db.save_middleware(&limit).unwrap();

    let mut template = TemplateConfig {
        compression: true,
        ..Default::default()
    };
    template.middleware.rate_limit = Some(limit.id.clone());

    let mut config = enabled_config();
    config.templates.insert("public".to_string(), template);

    let source = Arc::new(ScriptedSource::default());
    let mut w1 = workload("c1", "web", "web.example.com");
    w1.labels.insert("routesync.template".to_string(), "public".to_string());
    source.set(vec![w1]);

    watcher(&h, source, config).scan().await.unwrap();

    let proxy = &h.db.list_proxies().unwrap()[0];
    assert!(proxy.compression_enabled);
    assert_eq!(proxy.middleware.rate_limit.as_deref(), Some(limit.id.as_str()));
    assert_eq!(h.live.routes()[0]["handle"][0]["handler"], "rate_limit");
}

// ============================================================================
// Lifecycle events
// ============================================================================

#[tokio::test]
async fn test_stop_keeps_proxy_unless_policy_says_so() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source.clone(), enabled_config());
    w.scan().await.unwrap();

    let stop = LifecycleEvent {
        action: LifecycleAction::Stop,
        kind: SourceKind::Container,
        source_id: "c1".to_string(),
    };
    w.handle_event(&stop).await.unwrap();

    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Stopped);
    assert_eq!(h.live.routes().len(), 1);

    let removing = watcher(
        &h,
        source,
        DiscoveryConfig {
            auto_remove_stopped: true,
            ..enabled_config()
        },
    );
    removing.handle_event(&stop).await.unwrap();
    assert!(h.live.routes().is_empty());
    assert!(h.db.list_proxies().unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_with_immediate_policy_removes_proxy() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let config = DiscoveryConfig {
        remove_policy: RemovePolicy::Immediate,
        ..enabled_config()
    };
    let w = watcher(&h, source, config);
    w.scan().await.unwrap();

    w.handle_event(&LifecycleEvent {
        action: LifecycleAction::Destroy,
        kind: SourceKind::Container,
        source_id: "c1".to_string(),
    })
    .await
    .unwrap();

    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Removed);
    assert_eq!(service.linked_proxy_id, None);
    assert!(h.live.routes().is_empty());
}

#[tokio::test]
async fn test_event_stream_drives_watcher() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    let events = source.with_events();

    let w = Arc::new(watcher(&h, source.clone(), enabled_config()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = {
        let w = w.clone();
        tokio::spawn(async move { w.run(shutdown_rx).await })
    };

    source.set(vec![workload("c1", "web", "web.example.com")]);
    events
        .send(LifecycleEvent {
            action: LifecycleAction::Start,
            kind: SourceKind::Container,
            source_id: "c1".to_string(),
        })
        .unwrap();

    let appeared = tokio::time::timeout(Duration::from_secs(5), async {
        while h.live.routes().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(appeared.is_ok());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Staleness sweep
// ============================================================================

#[tokio::test]
async fn test_sweep_removes_stale_auto_managed_service() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source.clone(), enabled_config());
    w.scan().await.unwrap();
    assert_eq!(h.live.routes().len(), 1);

    let mut service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    let proxy_id = service.linked_proxy_id.clone().unwrap();
    service.last_seen = format_timestamp(Utc::now() - ChronoDuration::minutes(11));
    h.db.save_discovered_service(&service).unwrap();

    // container is gone, so the rescan does not refresh it
    source.set(Vec::new());
    let removed = w.sweep(Utc::now()).await.unwrap();
    assert_eq!(removed, 1);

    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Removed);
    assert!(h.db.get_proxy(&proxy_id).unwrap().is_none());
    assert!(!live_ids(&h.live).contains(&proxy_id));
}

#[tokio::test]
async fn test_sweep_retires_service_destroyed_after_die() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source.clone(), enabled_config());
    w.scan().await.unwrap();

    // docker reports die before destroy
    for action in [LifecycleAction::Die, LifecycleAction::Destroy] {
        w.handle_event(&LifecycleEvent {
            action,
            kind: SourceKind::Container,
            source_id: "c1".to_string(),
        })
        .await
        .unwrap();
    }
    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Stopped);
    assert_eq!(h.live.routes().len(), 1);

    source.set(Vec::new());
    let removed = w.sweep(Utc::now() + ChronoDuration::minutes(60)).await.unwrap();
    assert_eq!(removed, 1);

    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Removed);
    assert_eq!(service.linked_proxy_id, None);
    assert!(h.live.routes().is_empty());
    assert!(h.db.list_proxies().unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_keeps_services_seen_by_rescan() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    source.set(vec![workload("c1", "web", "web.example.com")]);

    let w = watcher(&h, source, enabled_config());
    w.scan().await.unwrap();

    let mut service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    service.last_seen = format_timestamp(Utc::now() - ChronoDuration::minutes(11));
    h.db.save_discovered_service(&service).unwrap();

    assert_eq!(w.sweep(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.live.routes().len(), 1);
}

#[tokio::test]
async fn test_sweep_leaves_unmanaged_proxies_alone() {
    let h = harness();
    let source = Arc::new(ScriptedSource::default());
    let mut unmanaged = workload("c1", "web", "web.example.com");
    unmanaged.labels.insert("routesync.managed".to_string(), "false".to_string());
    source.set(vec![unmanaged]);

    let w = watcher(&h, source.clone(), enabled_config());
    w.scan().await.unwrap();
    assert!(h.live.routes().is_empty());

    source.set(Vec::new());
    let later = Utc::now() + ChronoDuration::minutes(20);
    assert_eq!(w.cleanup_stale(later).await.unwrap(), 1);

    let service = h.db.get_discovered_service(SourceKind::Container, "c1").unwrap().unwrap();
    assert_eq!(service.status, ServiceStatus::Removed);
}
