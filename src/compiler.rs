//! Route compiler
//!
//! Turns a [`ProxyRecord`] and its attached middleware into the JSON route
//! understood by the remote server. Compilation is pure: no network, no
//! store access, and identical inputs always serialize to identical bytes.
//!
//! Handler order is fixed:
//! rate-limit -> ip-filter -> basic-auth -> compression -> terminal.
//! The terminal handler is either a single reverse proxy or, when path rules
//! are active, a sub-route table ending in a catch-all reverse proxy.

use crate::error::CompileError;
use crate::model::{
    BasicAuth, HeaderSet, IpFilterMode, IpRestriction, Middleware, MiddlewareKind, MiddlewareRefs,
    MiddlewareSpec, PathAction, PathRule, ProxyRecord, RateLimit, SecurityHeaders, SslMode,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use url::Url;

const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];
const DEFAULT_RATE_LIMIT_KEY: &str = "{http.request.remote.host}";

/// A middleware resolved from a reference, with its activation flag
#[derive(Debug, Clone, PartialEq)]
pub struct Attached<T> {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub spec: T,
}

/// All middleware a record references, resolved and type-checked
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachedMiddleware {
    pub headers: Option<Attached<HeaderSet>>,
    pub security_headers: Option<Attached<SecurityHeaders>>,
    pub rate_limit: Option<Attached<RateLimit>>,
    pub ip_restrictions: Vec<Attached<IpRestriction>>,
    pub path_rules: Vec<Attached<PathRule>>,
    pub basic_auth: Option<Attached<BasicAuth>>,
}

impl AttachedMiddleware {
    /// Resolve references against the middleware registry
    pub fn resolve(refs: &MiddlewareRefs, available: &[Middleware]) -> Result<Self, CompileError> {
        let mut attached = AttachedMiddleware::default();

        if let Some(id) = &refs.headers {
            let m = lookup(available, id, MiddlewareKind::Headers)?;
            if let MiddlewareSpec::Headers(spec) = &m.spec {
                attached.headers = Some(attach(m, spec.clone()));
            }
        }
        if let Some(id) = &refs.security_headers {
            let m = lookup(available, id, MiddlewareKind::SecurityHeaders)?;
            if let MiddlewareSpec::SecurityHeaders(spec) = &m.spec {
                attached.security_headers = Some(attach(m, spec.clone()));
            }
        }
        if let Some(id) = &refs.rate_limit {
            let m = lookup(available, id, MiddlewareKind::RateLimit)?;
            if let MiddlewareSpec::RateLimit(spec) = &m.spec {
                attached.rate_limit = Some(attach(m, spec.clone()));
            }
        }
        for id in &refs.ip_restrictions {
            let m = lookup(available, id, MiddlewareKind::IpRestriction)?;
            if let MiddlewareSpec::IpRestriction(spec) = &m.spec {
                attached.ip_restrictions.push(attach(m, spec.clone()));
            }
        }
        for id in &refs.path_rules {
            let m = lookup(available, id, MiddlewareKind::PathRule)?;
            if let MiddlewareSpec::PathRule(spec) = &m.spec {
                attached.path_rules.push(attach(m, spec.clone()));
            }
        }
        if let Some(id) = &refs.basic_auth {
            let m = lookup(available, id, MiddlewareKind::BasicAuth)?;
            if let MiddlewareSpec::BasicAuth(spec) = &m.spec {
                attached.basic_auth = Some(attach(m, spec.clone()));
            }
        }

        Ok(attached)
    }
}

fn lookup<'a>(
    available: &'a [Middleware],
    id: &str,
    kind: MiddlewareKind,
) -> Result<&'a Middleware, CompileError> {
    let found = available
        .iter()
        .find(|m| m.id == id)
        .ok_or_else(|| CompileError::new(format!("unknown middleware reference '{}'", id)))?;
    if found.kind() != kind {
        return Err(CompileError::new(format!(
            "middleware '{}' is a {} but is attached as {}",
            found.name,
            found.kind().as_str(),
            kind.as_str()
        )));
    }
    Ok(found)
}

fn attach<T>(m: &Middleware, spec: T) -> Attached<T> {
    Attached {
        id: m.id.clone(),
        name: m.name.clone(),
        enabled: m.enabled,
        spec,
    }
}

// ==================== Route JSON ====================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRoute {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "match")]
    pub matcher: Vec<HostMatcher>,
    pub handle: Vec<Handler>,
    pub terminal: bool,
}

impl CompiledRoute {
    pub fn to_value(&self) -> Result<Value, CompileError> {
        serde_json::to_value(self)
            .map_err(|e| CompileError::new(format!("route serialization failed: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostMatcher {
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RequestMatcher {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<RemoteIp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not: Option<Vec<RequestMatcher>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteIp {
    pub ranges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubRoute {
    #[serde(rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matcher: Vec<RequestMatcher>,
    pub handle: Vec<Handler>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubrouteRole {
    IpFilter,
    PathTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    RateLimit {
        rate_limits: BTreeMap<String, RateLimitZone>,
    },
    Subroute {
        routes: Vec<SubRoute>,
        #[serde(skip)]
        role: SubrouteRole,
    },
    Authentication {
        providers: AuthProviders,
    },
    Encode {
        encodings: BTreeMap<String, EmptyObject>,
        prefer: Vec<String>,
    },
    Rewrite {
        uri: String,
    },
    StaticResponse {
        status_code: u16,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, Vec<String>>,
    },
    ReverseProxy {
        upstreams: Vec<UpstreamDial>,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HeaderOps>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<Transport>,
    },
}

impl Handler {
    /// Whether this handler ends the chain by producing a response
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Handler::ReverseProxy { .. }
                | Handler::StaticResponse { .. }
                | Handler::Subroute {
                    role: SubrouteRole::PathTable,
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitZone {
    pub key: String,
    pub window: String,
    pub max_events: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthProviders {
    pub http_basic: HttpBasic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpBasic {
    pub accounts: Vec<BasicAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicAccount {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamDial {
    pub dial: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HeaderOps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HeaderOp>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HeaderOp {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
}

impl HeaderOp {
    fn is_empty(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transport {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<EmptyObject>,
}

// ==================== Compilation ====================

/// Compile a record into its live route
pub fn compile(
    record: &ProxyRecord,
    middleware: &AttachedMiddleware,
) -> Result<CompiledRoute, CompileError> {
    let matcher = build_matcher(record)?;
    let upstream = parse_upstream(&record.upstream.url)
        .map_err(|reason| CompileError::new(format!("proxy '{}': {}", record.name, reason)))?;

    let mut handle = Vec::new();

    if let Some(limit) = middleware.rate_limit.as_ref().filter(|m| m.enabled) {
        handle.push(rate_limit_handler(record, limit)?);
    }

    let restrictions: Vec<&Attached<IpRestriction>> =
        middleware.ip_restrictions.iter().filter(|m| m.enabled).collect();
    if !restrictions.is_empty() {
        handle.push(ip_filter_handler(&restrictions)?);
    }

    if let Some(auth) = middleware.basic_auth.as_ref().filter(|m| m.enabled) {
        handle.push(basic_auth_handler(auth)?);
    }

    if record.compression_enabled {
        handle.push(Handler::Encode {
            encodings: BTreeMap::from([
                ("gzip".to_string(), EmptyObject {}),
                ("zstd".to_string(), EmptyObject {}),
            ]),
            prefer: vec!["zstd".to_string(), "gzip".to_string()],
        });
    }

    let headers = header_ops(record, middleware);
    let primary = reverse_proxy(&upstream, headers.clone());

    let rules: Vec<&Attached<PathRule>> =
        middleware.path_rules.iter().filter(|m| m.enabled).collect();
    if rules.is_empty() {
        handle.push(primary);
    } else {
        handle.push(path_table(&rules, &upstream, headers, primary)?);
    }

    let terminals = handle.iter().filter(|h| h.is_terminal()).count();
    if terminals != 1 {
        return Err(CompileError::new(format!(
            "proxy '{}': route must have exactly one terminal handler, found {}",
            record.name, terminals
        )));
    }

    Ok(CompiledRoute {
        id: record.route_id(),
        matcher: vec![matcher],
        handle,
        terminal: true,
    })
}

fn build_matcher(record: &ProxyRecord) -> Result<HostMatcher, CompileError> {
    if record.domains.is_empty() {
        return Err(CompileError::new(format!(
            "proxy '{}' has no domains",
            record.name
        )));
    }

    let mut hosts = Vec::with_capacity(record.domains.len());
    for domain in &record.domains {
        let host = domain.host.trim();
        if host.is_empty() || host.contains(' ') || host.contains('/') {
            return Err(CompileError::new(format!(
                "proxy '{}': invalid domain '{}'",
                record.name, domain.host
            )));
        }
        if domain.ssl_mode == SslMode::Custom && domain.certificate_id.is_none() {
            return Err(CompileError::new(format!(
                "proxy '{}': domain '{}' uses a custom certificate but none is referenced",
                record.name, domain.host
            )));
        }
        hosts.push(host.to_string());
    }

    Ok(HostMatcher { host: hosts })
}

struct ParsedUpstream {
    dial: String,
    tls: bool,
}

fn parse_upstream(raw: &str) -> Result<ParsedUpstream, String> {
    if raw.trim().is_empty() {
        return Err("missing upstream URL".to_string());
    }
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid upstream URL '{}': {}", raw, e))?;
    let tls = match url.scheme() {
        "http" => false,
        "https" => true,
        other => return Err(format!("unsupported upstream scheme '{}'", other)),
    };
    let host = url
        .host_str()
        .ok_or_else(|| format!("upstream URL '{}' has no host", raw))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| format!("upstream URL '{}' has no port", raw))?;

    // IPv6 literals keep their brackets from host_str()
    Ok(ParsedUpstream {
        dial: format!("{}:{}", host, port),
        tls,
    })
}

fn reverse_proxy(upstream: &ParsedUpstream, headers: Option<HeaderOps>) -> Handler {
    Handler::ReverseProxy {
        upstreams: vec![UpstreamDial {
            dial: upstream.dial.clone(),
        }],
        headers,
        transport: upstream.tls.then(|| Transport {
            protocol: "http".to_string(),
            tls: Some(EmptyObject {}),
        }),
    }
}

fn rate_limit_handler(
    record: &ProxyRecord,
    limit: &Attached<RateLimit>,
) -> Result<Handler, CompileError> {
    if limit.spec.requests == 0 || limit.spec.window_secs == 0 {
        return Err(CompileError::new(format!(
            "rate limit '{}': requests and window_secs must be greater than 0",
            limit.name
        )));
    }

    let zone = RateLimitZone {
        key: limit
            .spec
            .key
            .clone()
            .unwrap_or_else(|| DEFAULT_RATE_LIMIT_KEY.to_string()),
        window: format!("{}s", limit.spec.window_secs),
        max_events: limit.spec.requests,
    };

    Ok(Handler::RateLimit {
        rate_limits: BTreeMap::from([(format!("proxy_{}", record.id), zone)]),
    })
}

fn ip_filter_handler(restrictions: &[&Attached<IpRestriction>]) -> Result<Handler, CompileError> {
    let mut routes = Vec::with_capacity(restrictions.len());

    for restriction in restrictions {
        if restriction.spec.ranges.is_empty() {
            return Err(CompileError::new(format!(
                "ip restriction '{}' has no ranges",
                restriction.name
            )));
        }
        for range in &restriction.spec.ranges {
            validate_ip_range(range).map_err(|reason| {
                CompileError::new(format!("ip restriction '{}': {}", restriction.name, reason))
            })?;
        }

        let remote = RequestMatcher {
            remote_ip: Some(RemoteIp {
                ranges: restriction.spec.ranges.clone(),
            }),
            ..Default::default()
        };
        let matcher = match restriction.spec.mode {
            IpFilterMode::Block => remote,
            IpFilterMode::Allow => RequestMatcher {
                not: Some(vec![remote]),
                ..Default::default()
            },
        };

        routes.push(SubRoute {
            matcher: vec![matcher],
            handle: vec![Handler::StaticResponse {
                status_code: 403,
                headers: BTreeMap::new(),
            }],
            terminal: true,
        });
    }

    Ok(Handler::Subroute {
        routes,
        role: SubrouteRole::IpFilter,
    })
}

fn validate_ip_range(range: &str) -> Result<(), String> {
    let (addr, prefix) = match range.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (range, None),
    };
    let ip: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| format!("invalid address '{}'", range))?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid prefix length in '{}'", range))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(format!("prefix length {} too large in '{}'", bits, range));
        }
    }
    Ok(())
}

fn basic_auth_handler(auth: &Attached<BasicAuth>) -> Result<Handler, CompileError> {
    if auth.spec.users.is_empty() {
        return Err(CompileError::new(format!(
            "basic auth '{}' has no users",
            auth.name
        )));
    }

    let mut accounts = Vec::with_capacity(auth.spec.users.len());
    for user in &auth.spec.users {
        if user.username.is_empty() || user.password_hash.is_empty() {
            return Err(CompileError::new(format!(
                "basic auth '{}': username and password hash are required",
                auth.name
            )));
        }
        accounts.push(BasicAccount {
            username: user.username.clone(),
            password: user.password_hash.clone(),
        });
    }

    Ok(Handler::Authentication {
        providers: AuthProviders {
            http_basic: HttpBasic {
                accounts,
                realm: auth.spec.realm.clone(),
            },
        },
    })
}

/// Upstream header overrides, header sets and security headers
fn header_ops(record: &ProxyRecord, middleware: &AttachedMiddleware) -> Option<HeaderOps> {
    let mut request = HeaderOp::default();
    let mut response = HeaderOp::default();

    for (name, value) in &record.upstream.headers {
        request.set.insert(name.clone(), vec![value.clone()]);
    }

    if let Some(headers) = middleware.headers.as_ref().filter(|m| m.enabled) {
        for (name, value) in &headers.spec.request_set {
            request.set.insert(name.clone(), vec![value.clone()]);
        }
        request.delete.extend(headers.spec.request_remove.iter().cloned());
        for (name, value) in &headers.spec.response_set {
            response.set.insert(name.clone(), vec![value.clone()]);
        }
        response.delete.extend(headers.spec.response_remove.iter().cloned());
    }

    if let Some(security) = middleware.security_headers.as_ref().filter(|m| m.enabled) {
        let spec = &security.spec;
        if let Some(max_age) = spec.hsts_max_age_secs {
            let mut value = format!("max-age={}", max_age);
            if spec.hsts_include_subdomains {
                value.push_str("; includeSubDomains");
            }
            response.set.insert("Strict-Transport-Security".to_string(), vec![value]);
        }
        if let Some(frame) = &spec.frame_options {
            response.set.insert("X-Frame-Options".to_string(), vec![frame.clone()]);
        }
        if spec.content_type_nosniff {
            response.set.insert("X-Content-Type-Options".to_string(), vec!["nosniff".to_string()]);
        }
        if let Some(policy) = &spec.referrer_policy {
            response.set.insert("Referrer-Policy".to_string(), vec![policy.clone()]);
        }
        if let Some(csp) = &spec.content_security_policy {
            response.set.insert("Content-Security-Policy".to_string(), vec![csp.clone()]);
        }
        if let Some(policy) = &spec.permissions_policy {
            response.set.insert("Permissions-Policy".to_string(), vec![policy.clone()]);
        }
    }

    request.delete.sort();
    request.delete.dedup();
    response.delete.sort();
    response.delete.dedup();

    if request.is_empty() && response.is_empty() {
        return None;
    }

    Some(HeaderOps {
        request: (!request.is_empty()).then_some(request),
        response: (!response.is_empty()).then_some(response),
    })
}

fn path_table(
    rules: &[&Attached<PathRule>],
    upstream: &ParsedUpstream,
    headers: Option<HeaderOps>,
    fallback: Handler,
) -> Result<Handler, CompileError> {
    let mut ordered: Vec<&Attached<PathRule>> = rules.to_vec();
    ordered.sort_by(|a, b| {
        b.spec
            .priority
            .cmp(&a.spec.priority)
            .then_with(|| b.spec.is_exact().cmp(&a.spec.is_exact()))
            .then_with(|| a.spec.pattern.cmp(&b.spec.pattern))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut routes = Vec::with_capacity(ordered.len() + 1);
    for rule in ordered {
        routes.push(path_route(rule, upstream, headers.clone())?);
    }
    routes.push(SubRoute {
        matcher: Vec::new(),
        handle: vec![fallback],
        terminal: true,
    });

    Ok(Handler::Subroute {
        routes,
        role: SubrouteRole::PathTable,
    })
}

fn path_route(
    rule: &Attached<PathRule>,
    upstream: &ParsedUpstream,
    headers: Option<HeaderOps>,
) -> Result<SubRoute, CompileError> {
    let fail = |reason: String| CompileError::new(format!("path rule '{}': {}", rule.name, reason));

    if !rule.spec.pattern.starts_with('/') {
        return Err(fail(format!(
            "pattern '{}' must start with '/'",
            rule.spec.pattern
        )));
    }

    let handle = match &rule.spec.action {
        PathAction::Proxy { target_url } => {
            let target = parse_upstream(target_url).map_err(fail)?;
            vec![reverse_proxy(&target, headers)]
        }
        PathAction::Redirect {
            target,
            redirect_code,
        } => {
            if !REDIRECT_CODES.contains(redirect_code) {
                return Err(fail(format!(
                    "redirect code {} is not one of 301, 302, 303, 307, 308",
                    redirect_code
                )));
            }
            if !is_redirect_target(target) {
                return Err(fail(format!("invalid redirect target '{}'", target)));
            }
            vec![Handler::StaticResponse {
                status_code: *redirect_code,
                headers: BTreeMap::from([("Location".to_string(), vec![target.clone()])]),
            }]
        }
        PathAction::Rewrite { rewrite_pattern } => {
            if rewrite_pattern.trim().is_empty() {
                return Err(fail("rewrite pattern must not be empty".to_string()));
            }
            vec![
                Handler::Rewrite {
                    uri: rewrite_pattern.clone(),
                },
                reverse_proxy(upstream, headers),
            ]
        }
    };

    Ok(SubRoute {
        matcher: vec![RequestMatcher {
            path: Some(vec![rule.spec.pattern.clone()]),
            ..Default::default()
        }],
        handle,
        terminal: true,
    })
}

fn is_redirect_target(target: &str) -> bool {
    if target.starts_with('/') {
        return true;
    }
    Url::parse(target)
        .map(|url| url.has_host())
        .unwrap_or(false)
}
