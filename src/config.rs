use crate::model::MiddlewareRefs;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the reconciler
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Remote server admin API
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Container discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Version-controlled desired state
    #[serde(default)]
    pub gitops: GitOpsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Base URL of the admin API (default: http://localhost:2019)
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Name of the HTTP server whose route list is managed (default: srv0)
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Listen addresses used when the server block has to be created
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Per-request timeout in seconds (default: 10)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient failures (default: 4)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds, doubled per retry (default: 200)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds (default: 5000)
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            server_name: default_server_name(),
            listen: default_listen(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

fn default_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_server_name() -> String {
    "srv0".to_string()
}

fn default_listen() -> Vec<String> {
    vec![":80".to_string(), ":443".to_string()]
}

fn default_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    4
}

fn default_backoff_base() -> u64 {
    200
}

fn default_backoff_max() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Directory holding snapshot files
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Key file for credential encryption (created if missing)
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            snapshot_dir: default_snapshot_dir(),
            key_file: default_key_file(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("./data/routesync.db")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./data/snapshots")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./data/secrets.key")
}

/// What happens to a discovered service once its workload is destroyed
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemovePolicy {
    /// Leave it for the staleness sweep
    #[default]
    Sweep,
    /// Remove the service and its proxy as soon as the event arrives
    Immediate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Docker endpoint; local socket when unset
    pub docker_host: Option<String>,

    /// Label namespace, e.g. `routesync.enable`
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Remove the linked proxy when a workload stops or dies
    #[serde(default)]
    pub auto_remove_stopped: bool,

    #[serde(default)]
    pub remove_policy: RemovePolicy,

    /// Age of `last_seen` after which an active service is removed (default: 600)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Interval between rescan + staleness sweeps (default: 300)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Delay before re-subscribing after the event stream drops (default: 5)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Named bundles applied through the `<prefix>.template` label
    #[serde(default)]
    pub templates: HashMap<String, TemplateConfig>,
}

impl DiscoveryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            docker_host: None,
            label_prefix: default_label_prefix(),
            auto_remove_stopped: false,
            remove_policy: RemovePolicy::default(),
            stale_after_secs: default_stale_after(),
            sweep_interval_secs: default_sweep_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            templates: HashMap::new(),
        }
    }
}

fn default_label_prefix() -> String {
    "routesync".to_string()
}

fn default_stale_after() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_reconnect_delay() -> u64 {
    5
}

/// Predefined middleware and flag bundle for discovered services
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TemplateConfig {
    #[serde(default)]
    pub middleware: MiddlewareRefs,

    #[serde(default)]
    pub compression: bool,

    pub http_to_https_redirect: Option<bool>,

    /// Extra upstream request headers
    #[serde(default)]
    pub upstream_headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitOpsConfig {
    /// Checkouts live in `<work_dir>/<source id>`
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Export file path inside the repository
    #[serde(default = "default_export_file")]
    pub export_file: String,

    /// Interval used for sources created without one (default: 300)
    #[serde(default = "default_sync_interval")]
    pub default_interval_secs: u64,

    /// `Name <email>` used for auto-commits
    #[serde(default = "default_commit_author")]
    pub commit_author: String,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            export_file: default_export_file(),
            default_interval_secs: default_sync_interval(),
            commit_author: default_commit_author(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/gitops")
}

fn default_export_file() -> String {
    "routesync.json".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_commit_author() -> String {
    "routesync <routesync@localhost>".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.remote.admin_url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(format!(
                "remote.admin_url: unsupported scheme '{}'",
                url.scheme()
            )),
            Err(e) => errors.push(format!("remote.admin_url: {}", e)),
        }
        if self.remote.server_name.trim().is_empty() {
            errors.push("remote.server_name must not be empty".to_string());
        }
        if self.remote.timeout_secs == 0 {
            errors.push("remote.timeout_secs must be greater than 0".to_string());
        }
        if self.remote.backoff_base_ms > self.remote.backoff_max_ms {
            errors.push("remote.backoff_base_ms must not exceed remote.backoff_max_ms".to_string());
        }

        if self.discovery.label_prefix.trim().is_empty() {
            errors.push("discovery.label_prefix must not be empty".to_string());
        }
        if self.discovery.stale_after_secs == 0 {
            errors.push("discovery.stale_after_secs must be greater than 0".to_string());
        }
        if self.discovery.sweep_interval_secs == 0 {
            errors.push("discovery.sweep_interval_secs must be greater than 0".to_string());
        }

        if self.gitops.export_file.trim().is_empty() || self.gitops.export_file.starts_with('/') {
            errors.push("gitops.export_file must be a relative path".to_string());
        }
        if self.gitops.default_interval_secs == 0 {
            errors.push("gitops.default_interval_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
