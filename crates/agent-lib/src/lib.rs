//! Core library for the CDN cache-node control loop
//!
//! This crate provides the building blocks shared by the daemons and the
//! agent CLI:
//! - Periodic HTTP probe engine with minimal-diff reconfiguration
//! - Monitoring config polling and peer/local state combining
//! - Parent availability control against the cache's host-status subsystem
//! - Config reconciliation: audit, atomic writes, service transitions
//! - Desired-state enrollment with idempotent creates
//! - Ops API client, health registry, and Prometheus metrics

pub mod enroll;
pub mod fsutil;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod ops;
pub mod parent;
pub mod poller;
pub mod reconcile;

pub use health::{ComponentStatus, HealthRegistry};
pub use models::*;
pub use observability::Metrics;
pub use ops::{OpsClient, OpsConfig};
