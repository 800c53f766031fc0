//! Desired-state data model
//!
//! These records are what administrators, discovery and GitOps exports
//! describe. The reconciliation engine is the only component that turns
//! them into live routes and the only writer of `route_index`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Prefix of the `@id` stamped on every route this crate manages
pub const TRACKED_ROUTE_PREFIX: &str = "routesync-";

/// Current timestamp in the format stored everywhere (sortable RFC 3339, UTC)
pub fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// ==================== Proxy Records ====================

/// TLS handling for a single domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Certificate obtained automatically by the remote server
    #[default]
    Automatic,
    /// Certificate supplied from the certificate store
    Custom,
    /// Plain HTTP only
    None,
}

impl SslMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "automatic" | "auto" => Some(Self::Automatic),
            "custom" => Some(Self::Custom),
            "none" | "off" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Custom => "custom",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEntry {
    /// Hostname or wildcard (`*.example.com`), kept verbatim
    pub host: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Certificate store id, required when `ssl_mode` is custom
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

impl DomainEntry {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ssl_mode: SslMode::Automatic,
            certificate_id: None,
        }
    }

    pub fn with_ssl(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.starts_with("*.")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    /// Request headers set on every proxied request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Upstream {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

/// Lifecycle of a proxy record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Pending,
    Active,
    Error,
    Removed,
}

impl ProxyStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

/// Middleware attached to a proxy, by id
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_restrictions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<String>,
}

impl MiddlewareRefs {
    /// All referenced middleware ids
    pub fn ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        ids.extend(self.headers.as_deref());
        ids.extend(self.security_headers.as_deref());
        ids.extend(self.rate_limit.as_deref());
        ids.extend(self.ip_restrictions.iter().map(String::as_str));
        ids.extend(self.path_rules.iter().map(String::as_str));
        ids.extend(self.basic_auth.as_deref());
        ids
    }

    pub fn references(&self, middleware_id: &str) -> bool {
        self.ids().contains(&middleware_id)
    }
}

/// Desired routing intent for one logical service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub name: String,
    pub domains: Vec<DomainEntry>,
    pub upstream: Upstream,
    #[serde(default)]
    pub middleware: MiddlewareRefs,
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default = "default_true")]
    pub http_to_https_redirect: bool,
    #[serde(default)]
    pub status: ProxyStatus,
    /// Position of the compiled route in the live route array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

fn default_true() -> bool {
    true
}

impl ProxyRecord {
    pub fn new(name: &str, domains: Vec<DomainEntry>, upstream_url: &str) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            domains,
            upstream: Upstream::new(upstream_url),
            middleware: MiddlewareRefs::default(),
            compression_enabled: false,
            http_to_https_redirect: true,
            status: ProxyStatus::Pending,
            route_index: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// `@id` of this record's compiled route
    pub fn route_id(&self) -> String {
        format!("{}{}", TRACKED_ROUTE_PREFIX, self.id)
    }

    /// Lowercase, trim and de-duplicate domains, keeping first occurrence order
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        let mut domains = Vec::with_capacity(self.domains.len());
        for mut domain in self.domains.drain(..) {
            domain.host = domain.host.trim().trim_end_matches('.').to_lowercase();
            if domain.host.is_empty() {
                continue;
            }
            if seen.insert(domain.host.clone()) {
                domains.push(domain);
            }
        }
        self.domains = domains;
        self.name = self.name.trim().to_string();
        self.upstream.url = self.upstream.url.trim().to_string();
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.host.as_str()).collect()
    }

    /// Sorted domain set plus upstream URL; unique across live records
    pub fn identity_key(&self) -> (Vec<String>, String) {
        let mut hosts: Vec<String> = self
            .domains
            .iter()
            .map(|d| d.host.trim().to_lowercase())
            .collect();
        hosts.sort();
        hosts.dedup();
        (hosts, self.upstream.url.trim().to_string())
    }

    /// Whether two records describe the same routing intent,
    /// ignoring bookkeeping (status, index, timestamps)
    pub fn same_intent(&self, other: &ProxyRecord) -> bool {
        self.name == other.name
            && self.domains == other.domains
            && self.upstream == other.upstream
            && self.middleware == other.middleware
            && self.compression_enabled == other.compression_enabled
            && self.http_to_https_redirect == other.http_to_https_redirect
    }

    /// Copy suitable for a desired-state export (no live bookkeeping)
    pub fn exported(&self) -> ProxyRecord {
        ProxyRecord {
            status: ProxyStatus::Pending,
            route_index: None,
            last_error: None,
            ..self.clone()
        }
    }
}

// ==================== Middleware ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareKind {
    Headers,
    SecurityHeaders,
    RateLimit,
    IpRestriction,
    PathRule,
    BasicAuth,
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::SecurityHeaders => "security_headers",
            Self::RateLimit => "rate_limit",
            Self::IpRestriction => "ip_restriction",
            Self::PathRule => "path_rule",
            Self::BasicAuth => "basic_auth",
        }
    }
}

/// Header manipulation applied around the upstream call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderSet {
    pub request_set: BTreeMap<String, String>,
    pub request_remove: Vec<String>,
    pub response_set: BTreeMap<String, String>,
    pub response_remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeaders {
    pub hsts_max_age_secs: Option<u64>,
    pub hsts_include_subdomains: bool,
    pub frame_options: Option<String>,
    pub content_type_nosniff: bool,
    pub referrer_policy: Option<String>,
    pub content_security_policy: Option<String>,
    pub permissions_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed per window
    pub requests: u32,
    pub window_secs: u64,
    /// Placeholder expression the limit is keyed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFilterMode {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRestriction {
    pub mode: IpFilterMode,
    /// Addresses or CIDR ranges
    pub ranges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PathAction {
    Proxy {
        target_url: String,
    },
    Redirect {
        target: String,
        redirect_code: u16,
    },
    Rewrite {
        rewrite_pattern: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    /// Path pattern; a trailing `*` makes it a prefix match
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
    pub action: PathAction,
}

impl PathRule {
    /// Exact patterns sort ahead of prefix/wildcard patterns at equal priority
    pub fn is_exact(&self) -> bool {
        !self.pattern.contains('*')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthUser {
    pub username: String,
    /// Already-hashed password (bcrypt)
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuth {
    pub realm: Option<String>,
    pub users: Vec<BasicAuthUser>,
}

/// Kind-specific middleware configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MiddlewareSpec {
    Headers(HeaderSet),
    SecurityHeaders(SecurityHeaders),
    RateLimit(RateLimit),
    IpRestriction(IpRestriction),
    PathRule(PathRule),
    BasicAuth(BasicAuth),
}

impl MiddlewareSpec {
    pub fn kind(&self) -> MiddlewareKind {
        match self {
            Self::Headers(_) => MiddlewareKind::Headers,
            Self::SecurityHeaders(_) => MiddlewareKind::SecurityHeaders,
            Self::RateLimit(_) => MiddlewareKind::RateLimit,
            Self::IpRestriction(_) => MiddlewareKind::IpRestriction,
            Self::PathRule(_) => MiddlewareKind::PathRule,
            Self::BasicAuth(_) => MiddlewareKind::BasicAuth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Middleware {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub spec: MiddlewareSpec,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Middleware {
    pub fn new(name: &str, spec: MiddlewareSpec) -> Self {
        let now = now_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            enabled: true,
            spec,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn kind(&self) -> MiddlewareKind {
        self.spec.kind()
    }
}

// ==================== Certificates ====================

/// PEM bundle for domains using `SslMode::Custom`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    pub name: String,
    pub certificate_pem: String,
    pub key_pem: String,
    #[serde(default)]
    pub created_at: String,
}

// ==================== Discovery ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Container,
    OrchestratedWorkload,
}

impl SourceKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" => Some(Self::Container),
            "orchestrated-workload" => Some(Self::OrchestratedWorkload),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::OrchestratedWorkload => "orchestrated-workload",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Stopped,
    Removed,
}

impl ServiceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "stopped" => Some(Self::Stopped),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        }
    }
}

/// Provenance linking an observed workload to at most one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub id: String,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub name: String,
    pub domain: String,
    pub upstream_url: String,
    pub auto_managed: bool,
    pub linked_proxy_id: Option<String>,
    pub template: Option<String>,
    pub last_seen: String,
    pub status: ServiceStatus,
    pub created_at: String,
}

// ==================== GitOps ====================

/// Pull- or push-based desired-state origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub branch: String,
    /// Encrypted credential (`user:token` or `token`)
    pub credential: Option<String>,
    pub auto_commit: bool,
    pub auto_sync: bool,
    pub sync_interval_secs: u64,
    pub last_applied_revision: Option<String>,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl GitSource {
    /// Reject configurations that would feed pulled state back into the same remote
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.url.trim().is_empty() {
            errors.push("url must not be empty".to_string());
        }
        if self.branch.trim().is_empty() {
            errors.push("branch must not be empty".to_string());
        }
        if self.auto_commit && self.auto_sync {
            errors.push("auto_commit and auto_sync cannot both be enabled on one source".to_string());
        }
        if self.auto_sync && self.sync_interval_secs == 0 {
            errors.push("sync_interval_secs must be greater than 0 when auto_sync is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

/// Export format stored in a version-controlled repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default = "default_export_version")]
    pub version: u32,
    #[serde(default)]
    pub proxies: Vec<ProxyRecord>,
    #[serde(default)]
    pub middleware: Vec<Middleware>,
}

fn default_export_version() -> u32 {
    1
}

impl Default for DesiredState {
    fn default() -> Self {
        Self {
            version: default_export_version(),
            proxies: Vec::new(),
            middleware: Vec::new(),
        }
    }
}

impl DesiredState {
    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let state: DesiredState = serde_json::from_str(content)?;
        if state.version != 1 {
            anyhow::bail!("Unsupported desired-state export version {}", state.version);
        }
        Ok(state)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Name-level difference between two proxy sets
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DesiredStateDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl DesiredStateDiff {
    pub fn compute(current: &[ProxyRecord], desired: &[ProxyRecord]) -> Self {
        let current_by_id: HashMap<&str, &ProxyRecord> =
            current.iter().map(|p| (p.id.as_str(), p)).collect();
        let desired_ids: HashSet<&str> = desired.iter().map(|p| p.id.as_str()).collect();

        let mut diff = DesiredStateDiff::default();
        for proxy in desired {
            match current_by_id.get(proxy.id.as_str()) {
                None => diff.added.push(proxy.name.clone()),
                Some(existing) if !existing.same_intent(proxy) => diff.changed.push(proxy.name.clone()),
                Some(_) => {}
            }
        }
        for proxy in current {
            if !desired_ids.contains(proxy.id.as_str()) {
                diff.removed.push(proxy.name.clone());
            }
        }

        diff.added.sort();
        diff.removed.sort();
        diff.changed.sort();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Pull,
    Push,
}

impl SyncDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

/// One applied GitOps change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub id: i64,
    pub source_id: String,
    pub revision: String,
    pub diff: DesiredStateDiff,
    pub actor: String,
    pub direction: SyncDirection,
    pub created_at: String,
}

// ==================== Snapshots ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Full live config as returned by the remote server
    Live,
    /// Desired-state export applied by a GitOps pull
    Export,
}

impl SnapshotKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "export" => Some(Self::Export),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Export => "export",
        }
    }

    pub fn file_prefix(&self) -> &'static str {
        match self {
            Self::Live => "snapshot",
            Self::Export => "export",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub kind: SnapshotKind,
    pub path: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub created_at: String,
}
