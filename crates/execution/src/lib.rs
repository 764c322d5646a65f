#![deny(missing_docs)]

//! Pipeline runtime for svq plans.
//!
//! Architecture role:
//! - runs every operator node of a [`svq_planner::Plan`] as its own tokio task
//! - connects nodes with bounded row channels and a shared stop signal
//! - exposes row producers (injector input) and row listeners (node output)
//!
//! Key modules:
//! - [`value`]
//! - [`eval`]
//! - [`stream`]
//! - [`listener`]
//! - [`pipeline`]

pub mod eval;
pub mod listener;
mod operators;
pub mod pipeline;
pub mod stream;
pub mod value;

pub use eval::{evaluate, resolve_parameters};
pub use listener::{rows_to_record_batch, RowCollector, RowListener};
pub use pipeline::{
    CompletionListener, PipelineOutcome, PipelineStatus, RowProducer, RunningPipeline, StopHandle,
};
pub use stream::{bounded_row_channel, BridgeMessage, RowInputs, RowSender, StopSignal};
pub use value::{Row, ScalarValue};
