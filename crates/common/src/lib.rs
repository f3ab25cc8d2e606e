//! Shared configuration, error types, IDs, and observability primitives for gqd crates.
//!
//! Architecture role:
//! - defines dispatcher/cluster configuration passed across layers
//! - provides common [`GqdError`] / [`Result`] contracts
//! - owns the process-wide [`JobIdAllocator`]
//! - hosts metrics and optional exporter utilities
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - `metrics_exporter` (feature-gated)
//!
//! Feature flags:
//! - `profiling`: enables the metrics HTTP exporter helpers.

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
#[cfg(feature = "profiling")]
pub mod metrics_exporter;

pub use config::{ClusterConfig, DispatchConfig, SessionConcurrency};
pub use error::{GqdError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
#[cfg(feature = "profiling")]
pub use metrics_exporter::run_metrics_exporter;
