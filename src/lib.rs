//! routesync - keeps a reverse proxy's live route list in step with a
//! declarative store of proxy records
//!
//! This library provides:
//! - A pure compiler from proxy records and middleware to route JSON
//! - A retrying client for the proxy's JSON admin API
//! - A serialized reconciliation engine that owns every route position
//! - Append-only snapshots of the live config with restore on startup
//! - Container discovery (Docker and Swarm) and GitOps pull/push

pub mod compiler;
pub mod config;
pub mod db;
pub mod discovery;
pub mod docker;
pub mod engine;
pub mod error;
pub mod gitops;
pub mod live;
pub mod model;
pub mod secrets;
pub mod service;
pub mod snapshot;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
