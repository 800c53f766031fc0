//! Reconciliation engine
//!
//! The only component allowed to touch the remote route list or a record's
//! `route_index`. Every mutation runs under one FIFO apply lock, so the
//! read-then-positional-write sequences against the remote server never
//! interleave.
//!
//! Store writes that describe live positions commit only after the remote
//! push succeeded. When the store write itself fails, the remote change is
//! compensated so desired and live state do not drift apart.

use crate::compiler::{compile, AttachedMiddleware};
use crate::config::RemoteConfig;
use crate::db::Database;
use crate::error::{CompileError, ReconcileError};
use crate::live::{routes_of, tracked_proxy_id, with_routes, CertificateBundle, LiveConfig};
use crate::model::{
    now_rfc3339, CertificateRecord, DesiredState, DesiredStateDiff, Middleware, ProxyRecord,
    ProxyStatus, SslMode,
};
use crate::snapshot::SnapshotManager;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Outcome of a full rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Tracked routes pushed
    pub applied: usize,
    /// Records left in `error` because they failed to compile
    pub failed: Vec<String>,
    /// Untracked routes preserved ahead of tracked ones
    pub foreign_routes: usize,
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored_snapshot: Option<PathBuf>,
    pub rebuild: RebuildReport,
}

/// A record whose stored `route_index` does not match the live route list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDrift {
    pub proxy: String,
    pub stored: Option<usize>,
    pub live: Option<usize>,
}

struct Prepared {
    route: Value,
    certificates: Vec<CertificateRecord>,
}

pub struct Engine {
    db: Arc<Database>,
    live: Arc<dyn LiveConfig>,
    snapshots: Arc<SnapshotManager>,
    server_name: String,
    listen: Vec<String>,
    apply_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl Engine {
    pub fn new(
        db: Arc<Database>,
        live: Arc<dyn LiveConfig>,
        snapshots: Arc<SnapshotManager>,
        remote: &RemoteConfig,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            db,
            live,
            snapshots,
            server_name: remote.server_name.clone(),
            listen: remote.listen.clone(),
            apply_lock: Mutex::new(()),
            changes,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Generation counter bumped after every successful mutation
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // ==================== Mutations ====================

    /// Compile, check uniqueness, append and record the new position
    pub async fn add_proxy(&self, record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        let _guard = self.apply_lock.lock().await;

        let exists = self
            .db
            .get_proxy(&record.id)
            .map_err(ReconcileError::store)?
            .is_some();
        if exists {
            self.update_locked(record).await
        } else {
            self.add_locked(record).await
        }
    }

    /// Recompile and replace the route in place; adds when not applied yet
    pub async fn update_proxy(&self, record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        let _guard = self.apply_lock.lock().await;
        self.update_locked(record).await
    }

    /// Re-apply the stored record, read under the apply lock so a concurrent
    /// update is never overwritten with an older copy
    pub async fn reapply(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        let _guard = self.apply_lock.lock().await;
        let record = self
            .db
            .get_proxy(id)
            .map_err(ReconcileError::store)?
            .ok_or_else(|| ReconcileError::NotFound(format!("proxy '{}'", id)))?;
        self.update_locked(record).await
    }

    /// Delete the route and shift every later index down by one
    pub async fn remove_proxy(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        let _guard = self.apply_lock.lock().await;
        self.remove_locked(id).await
    }

    /// Recompile every record and replace the live route list wholesale,
    /// keeping routes this crate does not manage
    pub async fn rebuild_from_store(&self) -> Result<RebuildReport, ReconcileError> {
        let _guard = self.apply_lock.lock().await;
        self.rebuild_locked().await
    }

    /// Replace the whole desired state (GitOps pull).
    ///
    /// The complete target set is validated first; any compile error or
    /// conflict in an exported record rejects the whole state. Records owned
    /// by discovery that fail to compile are kept in `error` without a route.
    /// The live config is pushed before the store transaction commits, and
    /// restored if the commit fails.
    pub async fn apply_desired_state_replace(
        &self,
        desired: DesiredState,
    ) -> Result<DesiredStateDiff, ReconcileError> {
        let _guard = self.apply_lock.lock().await;
        self.replace_locked(desired).await
    }

    // ==================== Recovery ====================

    /// Restore the latest snapshot when the remote server lost our routes,
    /// then rebuild from the store
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, ReconcileError> {
        let _guard = self.apply_lock.lock().await;

        let routes = self.live.get_routes().await?;
        let tracked_live = routes.iter().filter(|r| tracked_proxy_id(r).is_some()).count();
        let expected = self
            .db
            .list_proxies()
            .map_err(ReconcileError::store)?
            .iter()
            .filter(|r| r.route_index.is_some())
            .count();

        let mut report = RecoveryReport::default();
        if tracked_live == 0 && expected > 0 {
            warn!(expected, "Remote server has no tracked routes, restoring latest snapshot");
            report.restored_snapshot = self.snapshots.restore_latest(self.live.as_ref()).await?;
        }

        report.rebuild = self.rebuild_locked().await?;
        info!(
            restored = report.restored_snapshot.is_some(),
            applied = report.rebuild.applied,
            failed = report.rebuild.failed.len(),
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Push the latest snapshot and adopt the positions it contains
    pub async fn restore_latest(&self) -> Result<Option<PathBuf>, ReconcileError> {
        let _guard = self.apply_lock.lock().await;

        let restored = self.snapshots.restore_latest(self.live.as_ref()).await?;
        if restored.is_some() {
            self.adopt_live_positions().await?;
            self.changes.send_modify(|generation| *generation += 1);
        }
        Ok(restored)
    }

    /// Records whose stored index disagrees with the live route list
    pub async fn index_drift(&self) -> Result<Vec<IndexDrift>, ReconcileError> {
        let _guard = self.apply_lock.lock().await;

        let routes = self.live.get_routes().await?;
        let positions = live_positions(&routes);
        let records = self.db.list_proxies().map_err(ReconcileError::store)?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let live = positions.get(record.id.as_str()).copied();
                (live != record.route_index).then(|| IndexDrift {
                    proxy: record.name,
                    stored: record.route_index,
                    live,
                })
            })
            .collect())
    }

    // ==================== Locked Operations ====================

    async fn add_locked(&self, mut record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        record.normalize();
        record.route_index = None;
        validate_record(&record)?;

        let existing = self.db.list_proxies().map_err(ReconcileError::store)?;
        check_conflicts(&record, &existing)?;

        let middleware = self.db.list_middleware().map_err(ReconcileError::store)?;
        let prepared = match self.prepare(&record, &middleware) {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.persist_failure(record, e)),
        };

        if let Err(e) = self.load_certificates(&prepared.certificates).await {
            return Err(self.persist_failure(record, e));
        }

        let index = match self.live.append_route(&prepared.route).await {
            Ok(index) => index,
            Err(e) => return Err(self.persist_failure(record, e)),
        };

        record.route_index = Some(index);
        record.status = ProxyStatus::Active;
        record.last_error = None;
        record.updated_at = now_rfc3339();

        if let Err(e) = self.db.save_proxy(&record) {
            if let Err(undo) = self.live.delete_route_at(index).await {
                error!(proxy = %record.name, route_index = index, error = %undo,
                    "Failed to remove route after store failure");
            }
            return Err(ReconcileError::store(e));
        }

        info!(proxy = %record.name, route_index = index, "Proxy added");
        self.after_mutation().await;
        Ok(record)
    }

    async fn update_locked(&self, mut record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        record.normalize();

        let stored = self.db.get_proxy(&record.id).map_err(ReconcileError::store)?;
        let Some(stored) = stored else {
            return self.add_locked(record).await;
        };
        record.created_at = stored.created_at.clone();
        record.route_index = stored.route_index;

        let Some(index) = stored.route_index else {
            return self.add_locked(record).await;
        };

        validate_record(&record)?;
        let existing = self.db.list_proxies().map_err(ReconcileError::store)?;
        check_conflicts(&record, &existing)?;

        let middleware = self.db.list_middleware().map_err(ReconcileError::store)?;
        let prepared = match self.prepare(&record, &middleware) {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.persist_failure(record, e)),
        };

        if let Err(e) = self.load_certificates(&prepared.certificates).await {
            return Err(self.persist_failure(record, e));
        }

        let routes = match self.live.get_routes().await {
            Ok(routes) => routes,
            Err(e) => return Err(self.persist_failure(record, e)),
        };

        let Some(previous) = routes
            .get(index)
            .filter(|route| tracked_proxy_id(route) == Some(record.id.as_str()))
            .cloned()
        else {
            warn!(proxy = %record.name, route_index = index, "Route position drifted, rebuilding");
            record.status = ProxyStatus::Pending;
            record.updated_at = now_rfc3339();
            self.db.save_proxy(&record).map_err(ReconcileError::store)?;
            self.rebuild_locked().await?;
            return self
                .db
                .get_proxy(&record.id)
                .map_err(ReconcileError::store)?
                .ok_or_else(|| ReconcileError::NotFound(record.id.clone()));
        };

        if previous == prepared.route && stored.status == ProxyStatus::Active && stored.same_intent(&record) {
            debug!(proxy = %record.name, route_index = index, "Route unchanged");
            return Ok(stored);
        }

        if let Err(e) = self.live.replace_route_at(index, &prepared.route).await {
            return Err(self.persist_failure(record, e));
        }

        record.status = ProxyStatus::Active;
        record.last_error = None;
        record.updated_at = now_rfc3339();

        if let Err(e) = self.db.save_proxy(&record) {
            if let Err(undo) = self.live.replace_route_at(index, &previous).await {
                error!(proxy = %record.name, route_index = index, error = %undo,
                    "Failed to revert route after store failure");
            }
            return Err(ReconcileError::store(e));
        }

        info!(proxy = %record.name, route_index = index, "Proxy updated");
        self.after_mutation().await;
        Ok(record)
    }

    async fn remove_locked(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        let mut record = self
            .db
            .get_proxy(id)
            .map_err(ReconcileError::store)?
            .ok_or_else(|| ReconcileError::NotFound(format!("proxy '{}'", id)))?;

        match record.route_index {
            None => {
                self.db
                    .delete_proxy_and_shift(id, None)
                    .map_err(ReconcileError::store)?;
            }
            Some(index) => {
                let routes = self.live.get_routes().await?;
                let in_place = routes
                    .get(index)
                    .map(|route| tracked_proxy_id(route) == Some(id))
                    .unwrap_or(false);

                if in_place {
                    if let Err(e) = self.live.delete_route_at(index).await {
                        return Err(self.persist_failure(record, e));
                    }
                    if let Err(e) = self.db.delete_proxy_and_shift(id, Some(index)) {
                        // the route is gone but the store still has it: realign
                        error!(proxy = %record.name, error = %e, "Store failed after route removal");
                        if let Err(rebuild) = self.rebuild_locked().await {
                            error!(error = %rebuild, "Realigning rebuild failed");
                        }
                        return Err(ReconcileError::store(e));
                    }
                } else {
                    warn!(proxy = %record.name, route_index = index, "Route position drifted, rebuilding");
                    self.db
                        .delete_proxy_and_shift(id, None)
                        .map_err(ReconcileError::store)?;
                    self.rebuild_locked().await?;
                }
            }
        }

        info!(proxy = %record.name, route_index = ?record.route_index, "Proxy removed");
        record.status = ProxyStatus::Removed;
        record.route_index = None;
        record.updated_at = now_rfc3339();

        self.after_mutation().await;
        Ok(record)
    }

    async fn rebuild_locked(&self) -> Result<RebuildReport, ReconcileError> {
        let mut records = self.db.list_proxies().map_err(ReconcileError::store)?;
        order_for_rebuild(&mut records);
        let middleware = self.db.list_middleware().map_err(ReconcileError::store)?;

        let mut compiled = Vec::with_capacity(records.len());
        let mut failed = Vec::new();
        let mut certificates = Vec::new();

        for record in records {
            match self.prepare(&record, &middleware) {
                Ok(prepared) => {
                    certificates.extend(prepared.certificates);
                    compiled.push((record, prepared.route));
                }
                Err(e) => failed.push((record, e)),
            }
        }

        self.load_certificates(&certificates).await?;

        let config = self.live.get_full_config().await?;
        let mut routes: Vec<Value> = routes_of(&config, &self.server_name)
            .into_iter()
            .filter(|route| tracked_proxy_id(route).is_none())
            .collect();
        let foreign_routes = routes.len();

        let now = now_rfc3339();
        let mut updated = Vec::with_capacity(compiled.len() + failed.len());
        for (mut record, route) in compiled {
            record.route_index = Some(routes.len());
            record.status = ProxyStatus::Active;
            record.last_error = None;
            record.updated_at = now.clone();
            routes.push(route);
            updated.push(record);
        }

        let mut report = RebuildReport {
            applied: updated.len(),
            failed: Vec::new(),
            foreign_routes,
        };

        for (mut record, err) in failed {
            warn!(proxy = %record.name, error = %err, "Proxy failed to compile during rebuild");
            record.route_index = None;
            record.status = ProxyStatus::Error;
            record.last_error = Some(err.to_string());
            record.updated_at = now.clone();
            report.failed.push(record.name.clone());
            updated.push(record);
        }

        let target = with_routes(&config, &self.server_name, &self.listen, routes);
        if target != config {
            self.live.replace_full_config(&target).await?;
        }

        if let Err(e) = self.db.save_proxies(&updated) {
            if let Err(undo) = self.live.replace_full_config(&config).await {
                error!(error = %undo, "Failed to restore live config after store failure");
            }
            return Err(ReconcileError::store(e));
        }

        info!(
            applied = report.applied,
            failed = report.failed.len(),
            foreign = foreign_routes,
            "Rebuilt live routes from store"
        );
        self.after_mutation().await;
        Ok(report)
    }

    async fn replace_locked(&self, desired: DesiredState) -> Result<DesiredStateDiff, ReconcileError> {
        let current = self.db.list_proxies().map_err(ReconcileError::store)?;
        let current_middleware = self.db.list_middleware().map_err(ReconcileError::store)?;
        let preserved: HashSet<String> = self
            .db
            .auto_managed_proxy_ids()
            .map_err(ReconcileError::store)?
            .into_iter()
            .collect();

        let current_by_id: HashMap<&str, &ProxyRecord> =
            current.iter().map(|p| (p.id.as_str(), p)).collect();

        // Target middleware: the export plus anything preserved records still use
        let mut middleware = validate_middleware(desired.middleware)?;
        let desired_mw_ids: HashSet<String> = middleware.iter().map(|m| m.id.clone()).collect();

        let mut target: Vec<ProxyRecord> = Vec::new();
        let now = now_rfc3339();
        for mut record in desired.proxies {
            if preserved.contains(&record.id) {
                warn!(proxy = %record.name, "Skipping exported proxy owned by discovery");
                continue;
            }
            record.normalize();
            validate_record(&record)?;
            match current_by_id.get(record.id.as_str()) {
                Some(existing) => {
                    record.created_at = existing.created_at.clone();
                    record.route_index = existing.route_index;
                }
                None => {
                    if record.created_at.is_empty() {
                        record.created_at = now.clone();
                    }
                    record.route_index = None;
                }
            }
            record.updated_at = now.clone();
            target.push(record);
        }

        for record in &current {
            if preserved.contains(&record.id) {
                for id in record.middleware.ids() {
                    if !desired_mw_ids.contains(id) {
                        if let Some(kept) = current_middleware.iter().find(|m| m.id == id) {
                            if !middleware.iter().any(|m| m.id == kept.id) {
                                middleware.push(kept.clone());
                            }
                        }
                    }
                }
                target.push(record.clone());
            }
        }

        let mut seen_ids = HashSet::new();
        for (i, record) in target.iter().enumerate() {
            if !seen_ids.insert(record.id.as_str()) {
                return Err(ReconcileError::Conflict(format!(
                    "proxy id '{}' appears more than once",
                    record.id
                )));
            }
            check_conflicts(record, &target[..i])?;
        }

        // Validate everything before any network call
        order_for_rebuild(&mut target);
        let mut compiled = Vec::with_capacity(target.len());
        let mut certificates = Vec::new();
        for record in &target {
            match self.prepare(record, &middleware) {
                Ok(prepared) => {
                    certificates.extend(prepared.certificates);
                    compiled.push(Ok(prepared.route));
                }
                // discovery owns these; a broken one must not block the export
                Err(e) if preserved.contains(&record.id) => compiled.push(Err(e)),
                Err(e) => return Err(e),
            }
        }

        self.load_certificates(&certificates).await?;

        let config = self.live.get_full_config().await?;
        let mut routes: Vec<Value> = routes_of(&config, &self.server_name)
            .into_iter()
            .filter(|route| tracked_proxy_id(route).is_none())
            .collect();
        for (record, outcome) in target.iter_mut().zip(compiled) {
            match outcome {
                Ok(route) => {
                    record.route_index = Some(routes.len());
                    record.status = ProxyStatus::Active;
                    record.last_error = None;
                    routes.push(route);
                }
                Err(err) => {
                    warn!(proxy = %record.name, error = %err, "Discovered proxy failed to compile during replace");
                    record.route_index = None;
                    record.status = ProxyStatus::Error;
                    record.last_error = Some(err.to_string());
                    record.updated_at = now.clone();
                }
            }
        }

        let target_config = with_routes(&config, &self.server_name, &self.listen, routes);
        self.live.replace_full_config(&target_config).await?;

        let target_ids: HashSet<&str> = target.iter().map(|p| p.id.as_str()).collect();
        let delete_proxy_ids: Vec<String> = current
            .iter()
            .filter(|p| !target_ids.contains(p.id.as_str()))
            .map(|p| p.id.clone())
            .collect();
        let target_mw_ids: HashSet<&str> = middleware.iter().map(|m| m.id.as_str()).collect();
        let delete_middleware_ids: Vec<String> = current_middleware
            .iter()
            .filter(|m| !target_mw_ids.contains(m.id.as_str()))
            .map(|m| m.id.clone())
            .collect();

        if let Err(e) = self.db.replace_desired_state(
            &target,
            &delete_proxy_ids,
            &middleware,
            &delete_middleware_ids,
        ) {
            if let Err(undo) = self.live.replace_full_config(&config).await {
                error!(error = %undo, "Failed to restore live config after store failure");
            }
            return Err(ReconcileError::store(e));
        }

        let diff = DesiredStateDiff::compute(&current, &target);
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Desired state replaced"
        );
        self.after_mutation().await;
        Ok(diff)
    }

    /// Align stored indices with whatever the live route list holds
    async fn adopt_live_positions(&self) -> Result<(), ReconcileError> {
        let routes = self.live.get_routes().await?;
        let positions = live_positions(&routes);
        let records = self.db.list_proxies().map_err(ReconcileError::store)?;

        let now = now_rfc3339();
        let mut changed = Vec::new();
        for mut record in records {
            let live = positions.get(record.id.as_str()).copied();
            if live == record.route_index {
                continue;
            }
            record.route_index = live;
            record.status = match (live, record.status) {
                (None, _) => ProxyStatus::Pending,
                (Some(_), ProxyStatus::Error) => ProxyStatus::Error,
                (Some(_), _) => ProxyStatus::Active,
            };
            record.updated_at = now.clone();
            changed.push(record);
        }

        if !changed.is_empty() {
            info!(count = changed.len(), "Adopted live route positions");
            self.db.save_proxies(&changed).map_err(ReconcileError::store)?;
        }
        Ok(())
    }

    // ==================== Helpers ====================

    /// Compile a record and resolve the certificates it needs (no network)
    fn prepare(&self, record: &ProxyRecord, middleware: &[Middleware]) -> Result<Prepared, ReconcileError> {
        let attached = AttachedMiddleware::resolve(&record.middleware, middleware)
            .map_err(|e| CompileError::new(format!("proxy '{}': {}", record.name, e.reason)))?;
        let route = compile(record, &attached)?.to_value()?;

        let mut certificates = Vec::new();
        for domain in record.domains.iter().filter(|d| d.ssl_mode == SslMode::Custom) {
            let Some(cert_id) = &domain.certificate_id else {
                continue;
            };
            let cert = self
                .db
                .get_certificate(cert_id)
                .map_err(ReconcileError::store)?
                .ok_or_else(|| {
                    CompileError::new(format!(
                        "proxy '{}': certificate '{}' for {} not found",
                        record.name, cert_id, domain.host
                    ))
                })?;
            certificates.push(cert);
        }

        Ok(Prepared { route, certificates })
    }

    /// Load custom certificates the remote server does not have yet
    async fn load_certificates(&self, certificates: &[CertificateRecord]) -> Result<(), ReconcileError> {
        if certificates.is_empty() {
            return Ok(());
        }

        let loaded: HashSet<String> = self
            .live
            .list_certificates()
            .await?
            .into_iter()
            .flat_map(|bundle| bundle.tags)
            .collect();

        let mut pushed = HashSet::new();
        for cert in certificates {
            if loaded.contains(&cert.id) || !pushed.insert(cert.id.clone()) {
                continue;
            }
            self.live
                .load_certificate(&CertificateBundle {
                    certificate: cert.certificate_pem.clone(),
                    key: cert.key_pem.clone(),
                    tags: vec![cert.id.clone()],
                })
                .await?;
            info!(certificate = %cert.name, "Loaded custom certificate");
        }
        Ok(())
    }

    /// Mark a record failed, keeping its stored position, and hand back the error
    fn persist_failure(&self, mut record: ProxyRecord, err: ReconcileError) -> ReconcileError {
        if matches!(err, ReconcileError::Conflict(_) | ReconcileError::InvalidInput(_)) {
            return err;
        }

        let stored_index = match self.db.get_proxy(&record.id) {
            Ok(stored) => stored.and_then(|s| s.route_index),
            Err(e) => {
                error!(proxy = %record.name, error = %e, "Failed to read proxy while recording failure");
                return err;
            }
        };

        record.route_index = stored_index;
        record.status = ProxyStatus::Error;
        record.last_error = Some(err.to_string());
        record.updated_at = now_rfc3339();

        warn!(proxy = %record.name, error = %err, "Proxy apply failed");
        if let Err(e) = self.db.save_proxy(&record) {
            error!(proxy = %record.name, error = %e, "Failed to record proxy failure");
        }
        err
    }

    /// Snapshot the live config and notify auto-commit watchers.
    /// Snapshot failures are logged only.
    async fn after_mutation(&self) {
        match self.live.get_full_config().await {
            Ok(config) => {
                if let Err(e) = self.snapshots.snapshot(&config).await {
                    warn!(error = %e, "Failed to write snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to read live config for snapshot"),
        }
        self.changes.send_modify(|generation| *generation += 1);
    }
}

fn validate_record(record: &ProxyRecord) -> Result<(), ReconcileError> {
    if record.id.trim().is_empty() {
        return Err(ReconcileError::InvalidInput("proxy id must not be empty".to_string()));
    }
    if record.name.is_empty() {
        return Err(ReconcileError::InvalidInput("proxy name must not be empty".to_string()));
    }
    Ok(())
}

fn validate_middleware(middleware: Vec<Middleware>) -> Result<Vec<Middleware>, ReconcileError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for m in &middleware {
        if !ids.insert(m.id.clone()) {
            return Err(ReconcileError::Conflict(format!("middleware id '{}' appears more than once", m.id)));
        }
        if !names.insert(m.name.clone()) {
            return Err(ReconcileError::Conflict(format!("middleware name '{}' appears more than once", m.name)));
        }
    }
    Ok(middleware)
}

/// Reject a record whose name or (domains, upstream) pair is already taken
fn check_conflicts(record: &ProxyRecord, others: &[ProxyRecord]) -> Result<(), ReconcileError> {
    let identity = record.identity_key();
    for other in others
        .iter()
        .filter(|o| o.id != record.id && o.status != ProxyStatus::Removed)
    {
        if other.name == record.name {
            return Err(ReconcileError::Conflict(format!(
                "proxy name '{}' is already used",
                record.name
            )));
        }
        if other.identity_key() == identity {
            return Err(ReconcileError::Conflict(format!(
                "{} -> {} is already served by proxy '{}'",
                identity.0.join(","),
                identity.1,
                other.name
            )));
        }
    }
    Ok(())
}

/// Ascending route index, unapplied records last in creation order
fn order_for_rebuild(records: &mut [ProxyRecord]) {
    records.sort_by(|a, b| {
        let key = |r: &ProxyRecord| r.route_index.map(|i| (0, i)).unwrap_or((1, 0));
        key(a)
            .cmp(&key(b))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn live_positions(routes: &[Value]) -> HashMap<&str, usize> {
    routes
        .iter()
        .enumerate()
        .filter_map(|(i, route)| tracked_proxy_id(route).map(|id| (id, i)))
        .collect()
}
