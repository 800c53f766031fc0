//! Discovery watcher
//!
//! Turns labelled containers and orchestrated workloads into proxy records.
//! Every proxy change goes through the [`Engine`]; this module only owns the
//! `discovered_services` bookkeeping.
//!
//! Three inputs drive it: an initial scan, the lifecycle event stream, and a
//! periodic sweep that rescans and then retires services not seen for
//! `stale_after_secs`.

use crate::config::{DiscoveryConfig, RemovePolicy, TemplateConfig};
use crate::db::Database;
use crate::engine::Engine;
use crate::error::ReconcileError;
use crate::model::{
    format_timestamp, now_rfc3339, DiscoveredService, DomainEntry, ProxyRecord, ProxyStatus,
    ServiceStatus, SourceKind, SslMode,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A running container or orchestrated service as seen by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub kind: SourceKind,
    pub source_id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Host name or IP the remote server can dial
    pub address: Option<String>,
    /// Exposed ports, lowest first
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Die,
    Destroy,
    Update,
}

impl LifecycleAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" | "create" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "die" | "kill" => Some(Self::Die),
            "destroy" | "remove" => Some(Self::Destroy),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub kind: SourceKind,
    pub source_id: String,
}

/// Container or orchestrator API
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Running workloads
    async fn list_workloads(&self) -> Result<Vec<Workload>>;

    /// A single workload, `None` once it no longer exists
    async fn inspect(&self, kind: SourceKind, source_id: &str) -> Result<Option<Workload>>;

    /// Lifecycle events from now on; the stream ends when the connection drops
    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>>;
}

// ==================== Labels ====================

/// Routing labels of an enabled workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLabels {
    pub domains: Vec<String>,
    pub port: Option<u16>,
    pub scheme: String,
    pub upstream: Option<String>,
    pub template: Option<String>,
    pub ssl: SslMode,
    pub certificate: Option<String>,
    pub compression: Option<bool>,
    pub managed: bool,
}

impl ServiceLabels {
    /// `Ok(None)` when `<prefix>.enable` is not `true`
    pub fn parse(prefix: &str, labels: &HashMap<String, String>) -> Result<Option<Self>, String> {
        let get = |key: &str| {
            labels
                .get(&format!("{}.{}", prefix, key))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        if !get("enable").map(parse_bool).unwrap_or(Some(false)).unwrap_or(false) {
            return Ok(None);
        }

        let domains: Vec<String> = get("domain")
            .map(|v| {
                v.split(',')
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if domains.is_empty() {
            return Err(format!("missing {}.domain label", prefix));
        }

        let port = match get("port") {
            Some(v) => Some(v.parse::<u16>().map_err(|_| format!("invalid port '{}'", v))?),
            None => None,
        };

        let scheme = get("scheme").unwrap_or("http").to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(format!("unsupported scheme '{}'", scheme));
        }

        let ssl = match get("ssl") {
            Some(v) => SslMode::parse(&v.to_lowercase()).ok_or_else(|| format!("invalid ssl mode '{}'", v))?,
            None => SslMode::Automatic,
        };
        let certificate = get("certificate").map(str::to_string);
        if ssl == SslMode::Custom && certificate.is_none() {
            return Err(format!("ssl=custom requires a {}.certificate label", prefix));
        }

        let compression = match get("compression") {
            Some(v) => Some(parse_bool(v).ok_or_else(|| format!("invalid compression flag '{}'", v))?),
            None => None,
        };
        let managed = match get("managed") {
            Some(v) => parse_bool(v).ok_or_else(|| format!("invalid managed flag '{}'", v))?,
            None => true,
        };

        Ok(Some(Self {
            domains,
            port,
            scheme,
            upstream: get("upstream").map(str::to_string),
            template: get("template").map(str::to_string),
            ssl,
            certificate,
            compression,
            managed,
        }))
    }

    /// Explicit upstream label, else `<scheme>://<address>:<port>`
    pub fn upstream_url(&self, workload: &Workload) -> Result<String, String> {
        if let Some(upstream) = &self.upstream {
            return Ok(upstream.clone());
        }

        let address = workload
            .address
            .as_deref()
            .ok_or_else(|| format!("no address for {}", workload.name))?;
        let port = self
            .port
            .or_else(|| workload.ports.first().copied())
            .ok_or_else(|| format!("no port label and no exposed port on {}", workload.name))?;

        Ok(format!("{}://{}:{}", self.scheme, address, port))
    }

    fn domain_entries(&self) -> Vec<DomainEntry> {
        self.domains
            .iter()
            .map(|host| {
                let mut entry = DomainEntry::new(host).with_ssl(self.ssl);
                if self.ssl == SslMode::Custom {
                    entry.certificate_id = self.certificate.clone();
                }
                entry
            })
            .collect()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ==================== Watcher ====================

pub struct DiscoveryWatcher {
    engine: Arc<Engine>,
    db: Arc<Database>,
    source: Arc<dyn ContainerSource>,
    config: DiscoveryConfig,
}

impl DiscoveryWatcher {
    pub fn new(engine: Arc<Engine>, source: Arc<dyn ContainerSource>, config: DiscoveryConfig) -> Self {
        let db = engine.db().clone();
        Self {
            engine,
            db,
            source,
            config,
        }
    }

    /// Initial scan, then events and periodic sweeps until shutdown
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) {
        match self.scan().await {
            Ok(count) => info!(count, "Initial discovery scan complete"),
            Err(e) => error!(error = %e, "Initial discovery scan failed"),
        }

        tokio::join!(self.event_loop(shutdown_rx.clone()), self.sweep_loop(shutdown_rx));
        info!("Discovery watcher stopped");
    }

    async fn event_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let mut events = self.source.events();

            loop {
                tokio::select! {
                    item = events.next() => match item {
                        Some(Ok(event)) => {
                            if let Err(e) = self.handle_event(&event).await {
                                warn!(source_id = %event.source_id, action = ?event.action, error = %e,
                                    "Failed to handle discovery event");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Discovery event stream failed");
                            break;
                        }
                        None => {
                            warn!("Discovery event stream closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }

            // events may have been missed while disconnected
            if let Err(e) = self.scan().await {
                warn!(error = %e, "Rescan after reconnect failed");
            }
        }
    }

    async fn sweep_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval()) => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Discovery sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Observe every running workload; returns how many were enabled
    pub async fn scan(&self) -> Result<usize> {
        let workloads = self.source.list_workloads().await.context("Failed to list workloads")?;

        let mut enabled = 0;
        for workload in &workloads {
            match self.observe(workload).await {
                Ok(Some(_)) => enabled += 1,
                Ok(None) => {}
                Err(e) => warn!(workload = %workload.name, error = %e, "Failed to observe workload"),
            }
        }
        Ok(enabled)
    }

    /// Rescan, then retire stale services
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        if let Err(e) = self.scan().await {
            warn!(error = %e, "Rescan before sweep failed");
        }
        self.cleanup_stale(now).await
    }

    pub async fn handle_event(&self, event: &LifecycleEvent) -> Result<()> {
        debug!(source_id = %event.source_id, action = ?event.action, "Discovery event");

        match event.action {
            LifecycleAction::Start | LifecycleAction::Update => {
                match self.source.inspect(event.kind, &event.source_id).await? {
                    Some(workload) => {
                        self.observe(&workload).await?;
                    }
                    None => debug!(source_id = %event.source_id, "Workload vanished before inspection"),
                }
            }
            LifecycleAction::Stop | LifecycleAction::Die => {
                let remove = self.config.auto_remove_stopped;
                self.retire(event.kind, &event.source_id, ServiceStatus::Stopped, remove)
                    .await?;
            }
            LifecycleAction::Destroy => match self.config.remove_policy {
                RemovePolicy::Immediate => {
                    self.retire(event.kind, &event.source_id, ServiceStatus::Removed, true)
                        .await?;
                }
                // the staleness sweep retires it once last_seen ages out
                RemovePolicy::Sweep => {}
            },
        }
        Ok(())
    }

    /// Record an enabled workload and create or update its proxy.
    ///
    /// Returns `None` for workloads without the enable label.
    pub async fn observe(&self, workload: &Workload) -> Result<Option<DiscoveredService>> {
        let labels = match ServiceLabels::parse(&self.config.label_prefix, &workload.labels) {
            Ok(Some(labels)) => labels,
            Ok(None) => return Ok(None),
            Err(reason) => anyhow::bail!("{}: {}", workload.name, reason),
        };
        let upstream_url = labels
            .upstream_url(workload)
            .map_err(|reason| anyhow::anyhow!("{}: {}", workload.name, reason))?;

        let template = match &labels.template {
            Some(name) => match self.config.templates.get(name) {
                Some(t) => Some(t),
                None => {
                    warn!(workload = %workload.name, template = %name, "Unknown discovery template");
                    None
                }
            },
            None => None,
        };

        let now = now_rfc3339();
        let existing = self.db.get_discovered_service(workload.kind, &workload.source_id)?;
        let mut service = existing.unwrap_or_else(|| DiscoveredService {
            id: uuid::Uuid::new_v4().to_string(),
            source_kind: workload.kind,
            source_id: workload.source_id.clone(),
            name: workload.name.clone(),
            domain: String::new(),
            upstream_url: String::new(),
            auto_managed: labels.managed,
            linked_proxy_id: None,
            template: None,
            last_seen: now.clone(),
            status: ServiceStatus::Active,
            created_at: now.clone(),
        });

        service.name = workload.name.clone();
        service.domain = labels.domains.join(",");
        service.upstream_url = upstream_url.clone();
        service.auto_managed = labels.managed;
        service.template = labels.template.clone();
        service.last_seen = now;
        service.status = ServiceStatus::Active;

        if !service.auto_managed {
            self.db.save_discovered_service(&service)?;
            return Ok(Some(service));
        }

        let linked = match &service.linked_proxy_id {
            Some(id) => self.db.get_proxy(id)?,
            None => None,
        };

        let mut desired = match &linked {
            Some(stored) => stored.clone(),
            None => {
                let mut record = ProxyRecord::new(&workload.name, Vec::new(), &upstream_url);
                if let Some(id) = &service.linked_proxy_id {
                    record.id = id.clone();
                }
                record
            }
        };
        desired.domains = labels.domain_entries();
        desired.upstream.url = upstream_url;
        apply_template(&mut desired, template, labels.compression);
        desired.normalize();

        // link first so a failed apply is still retried on the next observation
        service.linked_proxy_id = Some(desired.id.clone());
        self.db.save_discovered_service(&service)?;

        let unchanged = linked
            .as_ref()
            .map(|stored| stored.status == ProxyStatus::Active && stored.same_intent(&desired))
            .unwrap_or(false);
        if unchanged {
            return Ok(Some(service));
        }

        let applied = if linked.is_some() {
            self.engine.update_proxy(desired).await
        } else {
            self.engine.add_proxy(desired).await
        };

        match applied {
            Ok(record) => {
                info!(workload = %workload.name, proxy = %record.name, route_index = ?record.route_index,
                    "Discovered service applied");
                Ok(Some(service))
            }
            Err(e) => Err(anyhow::anyhow!("{}: {}", workload.name, e)),
        }
    }

    /// Retire services whose `last_seen` is older than the staleness threshold
    pub async fn cleanup_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .context("Invalid staleness threshold")?;
        let cutoff = format_timestamp(now - stale_after);

        let stale = self.db.list_stale_services(&cutoff)?;
        let mut removed = 0;
        for service in stale {
            match self.retire_service(service, ServiceStatus::Removed, true).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, "Failed to retire stale service"),
            }
        }

        if removed > 0 {
            info!(removed, "Retired stale discovered services");
        }
        Ok(removed)
    }

    async fn retire(&self, kind: SourceKind, source_id: &str, status: ServiceStatus, remove_proxy: bool) -> Result<()> {
        match self.db.get_discovered_service(kind, source_id)? {
            Some(service) => self.retire_service(service, status, remove_proxy).await,
            None => Ok(()),
        }
    }

    async fn retire_service(&self, mut service: DiscoveredService, status: ServiceStatus, remove_proxy: bool) -> Result<()> {
        if remove_proxy && service.auto_managed {
            if let Some(proxy_id) = service.linked_proxy_id.take() {
                match self.engine.remove_proxy(&proxy_id).await {
                    Ok(record) => info!(service = %service.name, proxy = %record.name, "Removed discovered proxy"),
                    Err(ReconcileError::NotFound(_)) => {}
                    Err(e) => {
                        service.linked_proxy_id = Some(proxy_id);
                        return Err(anyhow::anyhow!("{}: {}", service.name, e));
                    }
                }
            }
        }

        debug!(service = %service.name, status = status.as_str(), "Discovered service retired");
        service.status = status;
        self.db.save_discovered_service(&service)?;
        Ok(())
    }
}

fn apply_template(record: &mut ProxyRecord, template: Option<&TemplateConfig>, compression: Option<bool>) {
    if let Some(t) = template {
        record.middleware = t.middleware.clone();
        record.compression_enabled = t.compression;
        if let Some(redirect) = t.http_to_https_redirect {
            record.http_to_https_redirect = redirect;
        }
        record.upstream.headers = t.upstream_headers.clone();
    }
    if let Some(enabled) = compression {
        record.compression_enabled = enabled;
    }
}
