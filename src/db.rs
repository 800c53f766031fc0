//! SQLite database for desired state
//!
//! Proxy records, middleware, certificates, discovery provenance, GitOps
//! sources and snapshot metadata. Multi-row changes that must stay
//! consistent with the live route list (index renumbering, desired-state
//! replacement, sync bookkeeping) run inside a single transaction.

use crate::model::{
    CertificateRecord, DesiredStateDiff, DiscoveredService, DomainEntry, GitSource, Middleware,
    MiddlewareRefs, MiddlewareSpec, ProxyRecord, ProxyStatus, ServiceStatus, SnapshotKind,
    SnapshotRecord, SourceKind, SyncDirection, SyncHistoryEntry, Upstream,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers unblocked while the engine commits
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: proxies, middleware, certificates
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: routing schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                domains TEXT NOT NULL,
                upstream TEXT NOT NULL,
                middleware TEXT NOT NULL DEFAULT '{}',
                compression_enabled INTEGER NOT NULL DEFAULT 0,
                http_to_https_redirect INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                route_index INTEGER,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS middleware (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                spec TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                certificate_pem TEXT NOT NULL,
                key_pem TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_proxies_route_index ON proxies(route_index);
            CREATE INDEX IF NOT EXISTS idx_middleware_kind ON middleware(kind);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: discovery, GitOps, snapshots
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: discovery, gitops and snapshots");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS discovered_services (
                id TEXT PRIMARY KEY,
                source_kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                upstream_url TEXT NOT NULL,
                auto_managed INTEGER NOT NULL DEFAULT 1,
                linked_proxy_id TEXT,
                template TEXT,
                last_seen TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                UNIQUE (source_kind, source_id)
            );

            CREATE TABLE IF NOT EXISTS git_sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                url TEXT NOT NULL,
                branch TEXT NOT NULL,
                credential TEXT,
                auto_commit INTEGER NOT NULL DEFAULT 0,
                auto_sync INTEGER NOT NULL DEFAULT 0,
                sync_interval_secs INTEGER NOT NULL DEFAULT 300,
                last_applied_revision TEXT,
                last_sync_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                revision TEXT NOT NULL,
                diff TEXT NOT NULL,
                actor TEXT NOT NULL,
                direction TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (source_id) REFERENCES git_sources(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS config_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                path TEXT NOT NULL UNIQUE,
                checksum TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_discovered_linked ON discovered_services(linked_proxy_id);
            CREATE INDEX IF NOT EXISTS idx_discovered_last_seen ON discovered_services(status, last_seen);
            CREATE INDEX IF NOT EXISTS idx_sync_history_source ON sync_history(source_id, id DESC);
            CREATE INDEX IF NOT EXISTS idx_snapshots_kind ON config_snapshots(kind, id DESC);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    // ==================== Proxy Operations ====================

    /// Insert or update a proxy record
    pub fn save_proxy(&self, proxy: &ProxyRecord) -> Result<()> {
        let conn = self.conn.lock();
        upsert_proxy(&conn, proxy).context("Failed to save proxy")
    }

    /// Insert or update several records in one transaction
    pub fn save_proxies(&self, proxies: &[ProxyRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for proxy in proxies {
            upsert_proxy(&tx, proxy)
                .with_context(|| format!("Failed to save proxy '{}'", proxy.name))?;
        }
        tx.commit().context("Failed to commit proxy batch")?;
        Ok(())
    }

    pub fn get_proxy(&self, id: &str) -> Result<Option<ProxyRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM proxies WHERE id = ?1", PROXY_COLUMNS),
            params![id],
            proxy_from_row,
        )
        .optional()
        .context("Failed to get proxy")
    }

    pub fn get_proxy_by_name(&self, name: &str) -> Result<Option<ProxyRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM proxies WHERE name = ?1", PROXY_COLUMNS),
            params![name],
            proxy_from_row,
        )
        .optional()
        .context("Failed to get proxy")
    }

    /// All stored records in creation order
    pub fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM proxies ORDER BY created_at, id",
            PROXY_COLUMNS
        ))?;

        let proxies = stmt
            .query_map([], proxy_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list proxies")?;

        Ok(proxies)
    }

    /// Delete a record and close the gap it leaves in the route list.
    ///
    /// Every record positioned after `removed_index` moves down by one and
    /// discovered services linked to the record are unlinked, all in one
    /// transaction.
    pub fn delete_proxy_and_shift(&self, id: &str, removed_index: Option<usize>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let rows = tx.execute("DELETE FROM proxies WHERE id = ?1", params![id])?;

        if let Some(index) = removed_index {
            tx.execute(
                "UPDATE proxies SET route_index = route_index - 1
                 WHERE route_index IS NOT NULL AND route_index > ?1",
                params![index as i64],
            )?;
        }

        tx.execute(
            "UPDATE discovered_services SET linked_proxy_id = NULL WHERE linked_proxy_id = ?1",
            params![id],
        )?;

        tx.commit().context("Failed to commit proxy removal")?;
        Ok(rows > 0)
    }

    /// Replace the desired state wholesale.
    ///
    /// Upserts `proxies` and `middleware`, deletes the listed ids and unlinks
    /// discovered services pointing at deleted proxies.
    pub fn replace_desired_state(
        &self,
        proxies: &[ProxyRecord],
        delete_proxy_ids: &[String],
        middleware: &[Middleware],
        delete_middleware_ids: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // names are unique, so deletions go first to free them
        for id in delete_proxy_ids {
            tx.execute("DELETE FROM proxies WHERE id = ?1", params![id])?;
            tx.execute(
                "UPDATE discovered_services SET linked_proxy_id = NULL WHERE linked_proxy_id = ?1",
                params![id],
            )?;
        }
        for id in delete_middleware_ids {
            tx.execute("DELETE FROM middleware WHERE id = ?1", params![id])?;
        }
        for m in middleware {
            upsert_middleware(&tx, m)
                .with_context(|| format!("Failed to save middleware '{}'", m.name))?;
        }
        for proxy in proxies {
            upsert_proxy(&tx, proxy)
                .with_context(|| format!("Failed to save proxy '{}'", proxy.name))?;
        }

        tx.commit().context("Failed to commit desired state")?;
        Ok(())
    }

    // ==================== Middleware Operations ====================

    pub fn save_middleware(&self, middleware: &Middleware) -> Result<()> {
        let conn = self.conn.lock();
        upsert_middleware(&conn, middleware).context("Failed to save middleware")
    }

    pub fn get_middleware(&self, id: &str) -> Result<Option<Middleware>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, enabled, spec, created_at, updated_at FROM middleware WHERE id = ?1",
            params![id],
            middleware_from_row,
        )
        .optional()
        .context("Failed to get middleware")
    }

    pub fn list_middleware(&self) -> Result<Vec<Middleware>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, enabled, spec, created_at, updated_at FROM middleware ORDER BY name",
        )?;

        let middleware = stmt
            .query_map([], middleware_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list middleware")?;

        Ok(middleware)
    }

    pub fn delete_middleware(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM middleware WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Certificate Operations ====================

    pub fn save_certificate(&self, cert: &CertificateRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO certificates (id, name, certificate_pem, key_pem, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                certificate_pem = excluded.certificate_pem,
                key_pem = excluded.key_pem",
            params![cert.id, cert.name, cert.certificate_pem, cert.key_pem, cert.created_at],
        )
        .context("Failed to save certificate")?;
        Ok(())
    }

    pub fn get_certificate(&self, id: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, certificate_pem, key_pem, created_at FROM certificates WHERE id = ?1",
            params![id],
            |row| {
                Ok(CertificateRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    certificate_pem: row.get(2)?,
                    key_pem: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get certificate")
    }

    pub fn delete_certificate(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ==================== Discovery Operations ====================

    pub fn save_discovered_service(&self, service: &DiscoveredService) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO discovered_services (id, source_kind, source_id, name, domain, upstream_url,
                auto_managed, linked_proxy_id, template, last_seen, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                upstream_url = excluded.upstream_url,
                auto_managed = excluded.auto_managed,
                linked_proxy_id = excluded.linked_proxy_id,
                template = excluded.template,
                last_seen = excluded.last_seen,
                status = excluded.status",
            params![
                service.id,
                service.source_kind.as_str(),
                service.source_id,
                service.name,
                service.domain,
                service.upstream_url,
                service.auto_managed,
                service.linked_proxy_id,
                service.template,
                service.last_seen,
                service.status.as_str(),
                service.created_at,
            ],
        )
        .context("Failed to save discovered service")?;
        Ok(())
    }

    pub fn get_discovered_service(
        &self,
        kind: SourceKind,
        source_id: &str,
    ) -> Result<Option<DiscoveredService>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM discovered_services WHERE source_kind = ?1 AND source_id = ?2",
                SERVICE_COLUMNS
            ),
            params![kind.as_str(), source_id],
            service_from_row,
        )
        .optional()
        .context("Failed to get discovered service")
    }

    pub fn list_discovered_services(&self) -> Result<Vec<DiscoveredService>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM discovered_services ORDER BY created_at, id",
            SERVICE_COLUMNS
        ))?;

        let services = stmt
            .query_map([], service_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list discovered services")?;

        Ok(services)
    }

    /// Active or stopped services not seen since `cutoff` (RFC 3339)
    pub fn list_stale_services(&self, cutoff: &str) -> Result<Vec<DiscoveredService>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM discovered_services
             WHERE status IN ('active', 'stopped') AND last_seen < ?1
             ORDER BY last_seen",
            SERVICE_COLUMNS
        ))?;

        let services = stmt
            .query_map(params![cutoff], service_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list stale services")?;

        Ok(services)
    }

    /// Proxy ids owned by auto-managed discovered services
    pub fn auto_managed_proxy_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT linked_proxy_id FROM discovered_services
             WHERE auto_managed = 1 AND status != 'removed' AND linked_proxy_id IS NOT NULL",
        )?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    // ==================== GitOps Operations ====================

    pub fn save_git_source(&self, source: &GitSource) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO git_sources (id, name, url, branch, credential, auto_commit, auto_sync,
                sync_interval_secs, last_applied_revision, last_sync_at, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                branch = excluded.branch,
                credential = excluded.credential,
                auto_commit = excluded.auto_commit,
                auto_sync = excluded.auto_sync,
                sync_interval_secs = excluded.sync_interval_secs",
            params![
                source.id,
                source.name,
                source.url,
                source.branch,
                source.credential,
                source.auto_commit,
                source.auto_sync,
                source.sync_interval_secs as i64,
                source.last_applied_revision,
                source.last_sync_at,
                source.last_error,
                source.created_at,
            ],
        )
        .context("Failed to save git source")?;
        Ok(())
    }

    pub fn get_git_source(&self, id: &str) -> Result<Option<GitSource>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM git_sources WHERE id = ?1", SOURCE_COLUMNS),
            params![id],
            source_from_row,
        )
        .optional()
        .context("Failed to get git source")
    }

    pub fn get_git_source_by_name(&self, name: &str) -> Result<Option<GitSource>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM git_sources WHERE name = ?1", SOURCE_COLUMNS),
            params![name],
            source_from_row,
        )
        .optional()
        .context("Failed to get git source")
    }

    pub fn list_git_sources(&self) -> Result<Vec<GitSource>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM git_sources ORDER BY name",
            SOURCE_COLUMNS
        ))?;

        let sources = stmt
            .query_map([], source_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list git sources")?;

        Ok(sources)
    }

    pub fn delete_git_source(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM git_sources WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Record an applied sync: history entry plus source bookkeeping, atomically.
    /// Only pulls advance `last_applied_revision`.
    pub fn record_sync_success(
        &self,
        source_id: &str,
        revision: &str,
        diff: &DesiredStateDiff,
        actor: &str,
        direction: SyncDirection,
        at: &str,
    ) -> Result<i64> {
        let diff_json = serde_json::to_string(diff)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO sync_history (source_id, revision, diff, actor, direction, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![source_id, revision, diff_json, actor, direction.as_str(), at],
        )?;
        let entry_id = tx.last_insert_rowid();

        match direction {
            SyncDirection::Pull => tx.execute(
                "UPDATE git_sources SET last_applied_revision = ?1, last_sync_at = ?2, last_error = NULL
                 WHERE id = ?3",
                params![revision, at, source_id],
            )?,
            SyncDirection::Push => tx.execute(
                "UPDATE git_sources SET last_sync_at = ?1, last_error = NULL WHERE id = ?2",
                params![at, source_id],
            )?,
        };

        tx.commit().context("Failed to commit sync record")?;
        Ok(entry_id)
    }

    /// Record a failed sync without touching the applied revision
    pub fn record_sync_failure(&self, source_id: &str, error: &str, at: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE git_sources SET last_error = ?1, last_sync_at = ?2 WHERE id = ?3",
            params![error, at, source_id],
        )
        .context("Failed to record sync failure")?;
        Ok(())
    }

    pub fn list_sync_history(&self, source_id: &str, limit: usize) -> Result<Vec<SyncHistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, revision, diff, actor, direction, created_at
             FROM sync_history WHERE source_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![source_id, limit as i64], |row| {
                let diff: String = row.get(3)?;
                let direction: String = row.get(5)?;
                Ok(SyncHistoryEntry {
                    id: row.get(0)?,
                    source_id: row.get(1)?,
                    revision: row.get(2)?,
                    diff: json_column(3, &diff)?,
                    actor: row.get(4)?,
                    direction: SyncDirection::parse(&direction)
                        .ok_or_else(|| invalid_enum(5, "direction", &direction))?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list sync history")?;

        Ok(entries)
    }

    // ==================== Snapshot Operations ====================

    pub fn record_snapshot(
        &self,
        kind: SnapshotKind,
        path: &str,
        checksum: &str,
        size_bytes: i64,
        created_at: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config_snapshots (kind, path, checksum, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind.as_str(), path, checksum, size_bytes, created_at],
        )
        .context("Failed to record snapshot")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent snapshots first
    pub fn list_snapshots(&self, kind: SnapshotKind, limit: usize) -> Result<Vec<SnapshotRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, path, checksum, size_bytes, created_at
             FROM config_snapshots WHERE kind = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let snapshots = stmt
            .query_map(params![kind.as_str(), limit as i64], |row| {
                let kind: String = row.get(1)?;
                Ok(SnapshotRecord {
                    id: row.get(0)?,
                    kind: SnapshotKind::parse(&kind)
                        .ok_or_else(|| invalid_enum(1, "snapshot kind", &kind))?,
                    path: row.get(2)?,
                    checksum: row.get(3)?,
                    size_bytes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list snapshots")?;

        Ok(snapshots)
    }

    pub fn get_snapshot_by_path(&self, path: &str) -> Result<Option<SnapshotRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, kind, path, checksum, size_bytes, created_at
             FROM config_snapshots WHERE path = ?1",
            params![path],
            |row| {
                let kind: String = row.get(1)?;
                Ok(SnapshotRecord {
                    id: row.get(0)?,
                    kind: SnapshotKind::parse(&kind)
                        .ok_or_else(|| invalid_enum(1, "snapshot kind", &kind))?,
                    path: row.get(2)?,
                    checksum: row.get(3)?,
                    size_bytes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to get snapshot")
    }
}

// ==================== Row Mapping ====================

const PROXY_COLUMNS: &str = "id, name, domains, upstream, middleware, compression_enabled,
    http_to_https_redirect, status, route_index, last_error, created_at, updated_at";

const SERVICE_COLUMNS: &str = "id, source_kind, source_id, name, domain, upstream_url,
    auto_managed, linked_proxy_id, template, last_seen, status, created_at";

const SOURCE_COLUMNS: &str = "id, name, url, branch, credential, auto_commit, auto_sync,
    sync_interval_secs, last_applied_revision, last_sync_at, last_error, created_at";

fn upsert_proxy(conn: &Connection, proxy: &ProxyRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO proxies (id, name, domains, upstream, middleware, compression_enabled,
            http_to_https_redirect, status, route_index, last_error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            domains = excluded.domains,
            upstream = excluded.upstream,
            middleware = excluded.middleware,
            compression_enabled = excluded.compression_enabled,
            http_to_https_redirect = excluded.http_to_https_redirect,
            status = excluded.status,
            route_index = excluded.route_index,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at",
        params![
            proxy.id,
            proxy.name,
            serde_json::to_string(&proxy.domains)?,
            serde_json::to_string(&proxy.upstream)?,
            serde_json::to_string(&proxy.middleware)?,
            proxy.compression_enabled,
            proxy.http_to_https_redirect,
            proxy.status.as_str(),
            proxy.route_index.map(|i| i as i64),
            proxy.last_error,
            proxy.created_at,
            proxy.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_middleware(conn: &Connection, middleware: &Middleware) -> Result<()> {
    conn.execute(
        "INSERT INTO middleware (id, name, kind, enabled, spec, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            kind = excluded.kind,
            enabled = excluded.enabled,
            spec = excluded.spec,
            updated_at = excluded.updated_at",
        params![
            middleware.id,
            middleware.name,
            middleware.kind().as_str(),
            middleware.enabled,
            serde_json::to_string(&middleware.spec)?,
            middleware.created_at,
            middleware.updated_at,
        ],
    )?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn invalid_enum(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid {} '{}'", what, value).into(),
    )
}

fn proxy_from_row(row: &Row) -> rusqlite::Result<ProxyRecord> {
    let domains: String = row.get(2)?;
    let upstream: String = row.get(3)?;
    let middleware: String = row.get(4)?;
    let status: String = row.get(7)?;
    let route_index: Option<i64> = row.get(8)?;

    Ok(ProxyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        domains: json_column::<Vec<DomainEntry>>(2, &domains)?,
        upstream: json_column::<Upstream>(3, &upstream)?,
        middleware: json_column::<MiddlewareRefs>(4, &middleware)?,
        compression_enabled: row.get(5)?,
        http_to_https_redirect: row.get(6)?,
        status: ProxyStatus::parse(&status).ok_or_else(|| invalid_enum(7, "status", &status))?,
        route_index: route_index.and_then(|i| usize::try_from(i).ok()),
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn middleware_from_row(row: &Row) -> rusqlite::Result<Middleware> {
    let spec: String = row.get(3)?;
    Ok(Middleware {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        spec: json_column::<MiddlewareSpec>(3, &spec)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn service_from_row(row: &Row) -> rusqlite::Result<DiscoveredService> {
    let kind: String = row.get(1)?;
    let status: String = row.get(10)?;
    Ok(DiscoveredService {
        id: row.get(0)?,
        source_kind: SourceKind::parse(&kind).ok_or_else(|| invalid_enum(1, "source kind", &kind))?,
        source_id: row.get(2)?,
        name: row.get(3)?,
        domain: row.get(4)?,
        upstream_url: row.get(5)?,
        auto_managed: row.get(6)?,
        linked_proxy_id: row.get(7)?,
        template: row.get(8)?,
        last_seen: row.get(9)?,
        status: ServiceStatus::parse(&status)
            .ok_or_else(|| invalid_enum(10, "service status", &status))?,
        created_at: row.get(11)?,
    })
}

fn source_from_row(row: &Row) -> rusqlite::Result<GitSource> {
    let interval: i64 = row.get(7)?;
    Ok(GitSource {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        branch: row.get(3)?,
        credential: row.get(4)?,
        auto_commit: row.get(5)?,
        auto_sync: row.get(6)?,
        sync_interval_secs: u64::try_from(interval).unwrap_or(0),
        last_applied_revision: row.get(8)?,
        last_sync_at: row.get(9)?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
    })
}
