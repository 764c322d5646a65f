//! Client side of svq: service catalog, row bridge and the execution bridge
//! that runs a SQL query against a service pipeline.
//!
//! Key modules:
//! - [`catalog`]
//! - [`bridge`]
//! - [`executor`]

pub mod bridge;
pub mod catalog;
pub mod executor;

pub use bridge::RowBridge;
pub use catalog::{ServiceCatalog, ServiceDefinition, ServiceResolver};
pub use executor::{BridgeState, ExecutionBridge};
