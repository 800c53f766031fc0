//! Administrative CRUD
//!
//! Validates operator input and routes every proxy change through the
//! engine. Middleware, certificates and git sources are plain store records,
//! but saving middleware re-applies every proxy that uses it.

use crate::compiler::{compile, AttachedMiddleware};
use crate::engine::Engine;
use crate::error::ReconcileError;
use crate::model::{
    now_rfc3339, CertificateRecord, DiscoveredService, GitSource, Middleware, ProxyRecord,
    ProxyStatus, SslMode, SyncHistoryEntry,
};
use crate::db::Database;
use crate::secrets::CredentialVault;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of re-applying the proxies that reference a middleware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiddlewareApplyReport {
    pub updated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct AdminService {
    engine: Arc<Engine>,
    db: Arc<Database>,
    vault: Arc<CredentialVault>,
}

impl AdminService {
    pub fn new(engine: Arc<Engine>, vault: Arc<CredentialVault>) -> Self {
        let db = engine.db().clone();
        Self { engine, db, vault }
    }

    // ==================== Proxies ====================

    pub async fn create_proxy(&self, record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        if self.db.get_proxy(&record.id).map_err(ReconcileError::store)?.is_some() {
            return Err(ReconcileError::Conflict(format!("proxy '{}' already exists", record.id)));
        }
        self.engine.add_proxy(record).await
    }

    pub async fn update_proxy(&self, record: ProxyRecord) -> Result<ProxyRecord, ReconcileError> {
        self.require_proxy(&record.id)?;
        self.engine.update_proxy(record).await
    }

    pub async fn delete_proxy(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        self.engine.remove_proxy(id).await
    }

    /// Re-apply a proxy left in `error`
    pub async fn retry_proxy(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        let record = self.require_proxy(id)?;
        if record.status != ProxyStatus::Error {
            return Err(ReconcileError::InvalidInput(format!(
                "proxy '{}' is {}, only failed proxies can be retried",
                record.name,
                record.status.as_str()
            )));
        }
        self.engine.reapply(id).await
    }

    pub fn get_proxy(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        self.require_proxy(id)
    }

    pub fn list_proxies(&self) -> Result<Vec<ProxyRecord>, ReconcileError> {
        self.db.list_proxies().map_err(ReconcileError::store)
    }

    fn require_proxy(&self, id: &str) -> Result<ProxyRecord, ReconcileError> {
        self.db
            .get_proxy(id)
            .map_err(ReconcileError::store)?
            .ok_or_else(|| ReconcileError::NotFound(format!("proxy '{}'", id)))
    }

    // ==================== Middleware ====================

    /// Save a middleware and re-apply the proxies that reference it.
    ///
    /// Every referencing proxy is compiled against the new version first;
    /// nothing is saved if any of them would fail.
    pub async fn save_middleware(&self, mut middleware: Middleware) -> Result<MiddlewareApplyReport, ReconcileError> {
        middleware.name = middleware.name.trim().to_string();
        if middleware.name.is_empty() {
            return Err(ReconcileError::InvalidInput("middleware name must not be empty".to_string()));
        }

        let mut available = self.db.list_middleware().map_err(ReconcileError::store)?;
        if let Some(other) = available
            .iter()
            .find(|m| m.name == middleware.name && m.id != middleware.id)
        {
            return Err(ReconcileError::Conflict(format!(
                "middleware name '{}' is already used by {}",
                middleware.name, other.id
            )));
        }

        match available.iter().find(|m| m.id == middleware.id) {
            Some(existing) => middleware.created_at = existing.created_at.clone(),
            None if middleware.created_at.is_empty() => middleware.created_at = now_rfc3339(),
            None => {}
        }
        middleware.updated_at = now_rfc3339();
        available.retain(|m| m.id != middleware.id);
        available.push(middleware.clone());

        let referencing: Vec<ProxyRecord> = self
            .list_proxies()?
            .into_iter()
            .filter(|p| p.middleware.references(&middleware.id))
            .collect();

        for proxy in &referencing {
            let attached = AttachedMiddleware::resolve(&proxy.middleware, &available)?;
            compile(proxy, &attached)?;
        }

        self.db.save_middleware(&middleware).map_err(ReconcileError::store)?;
        info!(middleware = %middleware.name, kind = middleware.kind().as_str(), proxies = referencing.len(),
            "Middleware saved");

        let mut report = MiddlewareApplyReport::default();
        for ProxyRecord { id, name, .. } in referencing {
            match self.engine.reapply(&id).await {
                Ok(_) => report.updated.push(name),
                Err(e) => {
                    warn!(proxy = %name, error = %e, "Failed to re-apply proxy after middleware change");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Delete an unreferenced middleware
    pub fn delete_middleware(&self, id: &str) -> Result<(), ReconcileError> {
        let users: Vec<String> = self
            .list_proxies()?
            .into_iter()
            .filter(|p| p.middleware.references(id))
            .map(|p| p.name)
            .collect();
        if !users.is_empty() {
            return Err(ReconcileError::Conflict(format!(
                "middleware '{}' is used by {}",
                id,
                users.join(", ")
            )));
        }

        if !self.db.delete_middleware(id).map_err(ReconcileError::store)? {
            return Err(ReconcileError::NotFound(format!("middleware '{}'", id)));
        }
        Ok(())
    }

    pub fn list_middleware(&self) -> Result<Vec<Middleware>, ReconcileError> {
        self.db.list_middleware().map_err(ReconcileError::store)
    }

    // ==================== Certificates ====================

    pub fn save_certificate(&self, cert: &CertificateRecord) -> Result<(), ReconcileError> {
        if !cert.certificate_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(ReconcileError::InvalidInput("certificate is not PEM encoded".to_string()));
        }
        if !cert.key_pem.contains("PRIVATE KEY-----") {
            return Err(ReconcileError::InvalidInput("key is not a PEM private key".to_string()));
        }
        self.db.save_certificate(cert).map_err(ReconcileError::store)
    }

    /// Delete a certificate no custom-SSL domain refers to
    pub fn delete_certificate(&self, id: &str) -> Result<(), ReconcileError> {
        let users: Vec<String> = self
            .list_proxies()?
            .into_iter()
            .filter(|p| {
                p.domains
                    .iter()
                    .any(|d| d.ssl_mode == SslMode::Custom && d.certificate_id.as_deref() == Some(id))
            })
            .map(|p| p.name)
            .collect();
        if !users.is_empty() {
            return Err(ReconcileError::Conflict(format!(
                "certificate '{}' is used by {}",
                id,
                users.join(", ")
            )));
        }

        if !self.db.delete_certificate(id).map_err(ReconcileError::store)? {
            return Err(ReconcileError::NotFound(format!("certificate '{}'", id)));
        }
        Ok(())
    }

    // ==================== Git Sources ====================

    /// Validate and store a source; a plaintext credential is encrypted first
    pub fn add_git_source(&self, mut source: GitSource) -> Result<GitSource, ReconcileError> {
        source.validate().map_err(ReconcileError::InvalidInput)?;

        if let Some(other) = self
            .db
            .get_git_source_by_name(&source.name)
            .map_err(ReconcileError::store)?
            .filter(|other| other.id != source.id)
        {
            return Err(ReconcileError::Conflict(format!(
                "git source name '{}' is already used by {}",
                source.name, other.id
            )));
        }

        if let Some(credential) = source.credential.take().filter(|c| !c.is_empty()) {
            let stored = if CredentialVault::is_encrypted(&credential) {
                credential
            } else {
                self.vault.encrypt(&credential).map_err(ReconcileError::store)?
            };
            source.credential = Some(stored);
        }

        self.db.save_git_source(&source).map_err(ReconcileError::store)?;
        info!(source = %source.name, auto_sync = source.auto_sync, auto_commit = source.auto_commit,
            "Git source saved");
        Ok(source)
    }

    pub fn list_git_sources(&self) -> Result<Vec<GitSource>, ReconcileError> {
        self.db.list_git_sources().map_err(ReconcileError::store)
    }

    /// Look a source up by id, then by name
    pub fn find_git_source(&self, key: &str) -> Result<GitSource, ReconcileError> {
        if let Some(source) = self.db.get_git_source(key).map_err(ReconcileError::store)? {
            return Ok(source);
        }
        self.db
            .get_git_source_by_name(key)
            .map_err(ReconcileError::store)?
            .ok_or_else(|| ReconcileError::NotFound(format!("git source '{}'", key)))
    }

    pub fn delete_git_source(&self, id: &str) -> Result<(), ReconcileError> {
        if !self.db.delete_git_source(id).map_err(ReconcileError::store)? {
            return Err(ReconcileError::NotFound(format!("git source '{}'", id)));
        }
        Ok(())
    }

    pub fn sync_history(&self, source_id: &str, limit: usize) -> Result<Vec<SyncHistoryEntry>, ReconcileError> {
        self.db
            .list_sync_history(source_id, limit)
            .map_err(ReconcileError::store)
    }

    // ==================== Discovery ====================

    pub fn list_discovered_services(&self) -> Result<Vec<DiscoveredService>, ReconcileError> {
        self.db.list_discovered_services().map_err(ReconcileError::store)
    }
}
