//! Query model and SQL-to-pipeline compiler.
//!
//! Flow: SQL text -> [`Query`] ([`sql_to_query`]) -> reference check
//! ([`bind_query`]) -> operator [`Plan`] ([`PlanBuilder`]). Pushdown
//! parameters for the service pipeline come from [`extract_parameters`].

pub mod binder;
pub mod builder;
pub mod condition;
pub mod explain;
pub mod iif;
pub mod params;
pub mod plan;
pub mod query;
pub mod schema;
pub mod sql_frontend;

pub use binder::bind_query;
pub use builder::PlanBuilder;
pub use condition::*;
pub use explain::explain_plan;
pub use iif::lower_iif;
pub use params::extract_parameters;
pub use plan::*;
pub use query::*;
pub use schema::{ColumnDef, RowSchema};
pub use sql_frontend::sql_to_query;
