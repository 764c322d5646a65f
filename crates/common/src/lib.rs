//! Shared configuration, error types, IDs, and observability primitives for svq crates.
//!
//! Architecture role:
//! - defines engine configuration passed from the client down to the runtime
//! - provides the common [`SvqError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{Result, SvqError};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
