use thiserror::Error;

/// Canonical svq error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SvqError::Binding`]: a field/alias reference that does not resolve against a schema
/// - [`SvqError::PlanConstruction`]: the query shape cannot be turned into an operator graph
/// - [`SvqError::ServiceResolution`]: unknown service or missing service output operator
/// - [`SvqError::Execution`]: failures while starting or running a pipeline
/// - [`SvqError::Cancelled`]: a task unwound because its pipeline was stopped
/// - [`SvqError::InvalidConfig`]: catalog/config/environment contract violations
/// - [`SvqError::Unsupported`]: syntactically valid but intentionally unimplemented SQL
/// - [`SvqError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum SvqError {
    /// Unresolved field or alias.
    ///
    /// Examples:
    /// - `SELECT missing FROM svc`
    /// - `ORDER BY x` where `x` is neither a column nor a select alias
    #[error("binding error: {0}")]
    Binding(String),

    /// The plan builder could not emit a valid operator graph.
    ///
    /// Examples:
    /// - `COUNT(*)` over an input that has no columns at all
    /// - a generated graph that fails its structural validation
    #[error("plan construction error: {0}")]
    PlanConstruction(String),

    /// Service lookup failures, raised while preparing a query.
    #[error("service resolution error: {0}")]
    ServiceResolution(String),

    /// Runtime failures after planning succeeded.
    #[error("execution error: {0}")]
    Execution(String),

    /// Stop signal observed by a running task.
    ///
    /// Never reported as the cause of a failed query when another error
    /// triggered the stop.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a SQL shape not implemented in this version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SvqError {
    /// Whether this error only reflects a stop request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SvqError::Cancelled(_))
    }
}

/// Standard svq result alias.
pub type Result<T> = std::result::Result<T, SvqError>;
