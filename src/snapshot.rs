//! Snapshot manager
//!
//! Append-only backups of the live config (and of applied desired-state
//! exports). One file per snapshot, named by capture time plus a process
//! sequence number, never overwritten. Metadata and a SHA-256 checksum are
//! kept in the database so restores can skip damaged files.

use crate::db::Database;
use crate::error::ReconcileError;
use crate::live::LiveConfig;
use crate::model::{format_timestamp, DesiredState, SnapshotKind, SnapshotRecord};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct SnapshotManager {
    dir: PathBuf,
    db: Arc<Database>,
    sequence: AtomicU64,
}

impl SnapshotManager {
    pub fn new(dir: impl Into<PathBuf>, db: Arc<Database>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create snapshot directory {}", dir.display()))?;

        Ok(Self {
            dir,
            db,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture the full live config
    pub async fn snapshot(&self, config: &Value) -> Result<SnapshotRecord> {
        let bytes = serde_json::to_vec_pretty(config)?;
        self.write(SnapshotKind::Live, &bytes).await
    }

    /// Capture a desired-state export applied by a GitOps pull
    pub async fn snapshot_export(&self, state: &DesiredState) -> Result<SnapshotRecord> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.write(SnapshotKind::Export, &bytes).await
    }

    async fn write(&self, kind: SnapshotKind, bytes: &[u8]) -> Result<SnapshotRecord> {
        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}-{}-{:020}.json",
            kind.file_prefix(),
            now.format("%Y%m%dT%H%M%S%.6fZ"),
            seq
        );
        let path = self.dir.join(&name);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to create snapshot {}", path.display()))?;
        file.write_all(bytes).await?;
        file.sync_all().await?;

        let checksum = hex::encode(Sha256::digest(bytes));
        let path_str = path.to_string_lossy().to_string();
        let created_at = format_timestamp(now);
        let id = self
            .db
            .record_snapshot(kind, &path_str, &checksum, bytes.len() as i64, &created_at)?;

        debug!(path = %path.display(), kind = kind.as_str(), size = bytes.len(), "Snapshot written");

        Ok(SnapshotRecord {
            id,
            kind,
            path: path_str,
            checksum,
            size_bytes: bytes.len() as i64,
            created_at,
        })
    }

    /// Snapshot files of `kind`, newest first
    pub fn files(&self, kind: SnapshotKind) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}-", kind.file_prefix());
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read snapshot directory {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();

        // names embed the capture time, so lexical order is chronological
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Most recent intact live snapshot
    pub async fn load_latest(&self) -> Result<Option<(PathBuf, Value)>> {
        for path in self.files(SnapshotKind::Live)? {
            match self.load(&path).await {
                Ok(config) => return Ok(Some((path, config))),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(None)
    }

    async fn load(&self, path: &Path) -> Result<Value> {
        let bytes = tokio::fs::read(path).await?;

        let path_str = path.to_string_lossy();
        if let Some(record) = self.db.get_snapshot_by_path(&path_str)? {
            let checksum = hex::encode(Sha256::digest(&bytes));
            if checksum != record.checksum {
                anyhow::bail!("checksum mismatch (expected {}, found {})", record.checksum, checksum);
            }
        }

        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Push the most recent snapshot back to the remote server.
    ///
    /// Returns the restored file, or `None` when no snapshot exists.
    pub async fn restore_latest(&self, live: &dyn LiveConfig) -> Result<Option<PathBuf>, ReconcileError> {
        let latest = self.load_latest().await.map_err(ReconcileError::store)?;
        let Some((path, config)) = latest else {
            return Ok(None);
        };

        live.replace_full_config(&config).await?;
        info!(path = %path.display(), "Restored live config from snapshot");
        Ok(Some(path))
    }

    pub fn list(&self, kind: SnapshotKind, limit: usize) -> Result<Vec<SnapshotRecord>> {
        self.db.list_snapshots(kind, limit)
    }
}
