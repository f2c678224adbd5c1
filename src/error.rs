//! Crate-wide error types.
//!
//! One enum per spec'd error kind (expression evaluation, pipeline
//! compilation, external event-source adapters), following the teacher's
//! per-concern `thiserror` enums.

use thiserror::Error;

/// Errors raised by expression evaluation, pipeline compilation, and the
/// streaming collection's public API.
#[derive(Error, Debug, Clone)]
pub enum AggError {
    /// A pipeline stage or sub-document was structurally invalid.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// An operator-object key did not name a registered operator.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// A `$$NAME` system variable was not recognized.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    /// An operator received an argument of the wrong shape (e.g. `$reduce`
    /// over a non-array).
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A stage or operator is not supported on the incremental path and
    /// the pipeline must run batch-only (or is rejected outright for the
    /// explicitly unsupported stages named in spec.md's Non-goals).
    #[error("unsupported for incremental execution: {0}")]
    UnsupportedStage(String),

    /// An external event source's transform callback raised an error.
    #[error("transform error: {0}")]
    TransformError(String),

    /// Internal: an IVM operator failed while applying a delta. Carried
    /// only within the streaming collection's recovery path (spec.md §4.3,
    /// §7) — callers of the public API never see this variant directly,
    /// it is unwrapped into a rebuild attempt or, on repeated failure,
    /// logged and swallowed in favor of the last good result.
    #[error("soft failure during delta application: {0}")]
    Soft(Box<AggError>),
}

impl AggError {
    pub fn invalid_pipeline(msg: impl Into<String>) -> Self {
        AggError::InvalidPipeline(msg.into())
    }

    pub fn unknown_operator(name: impl Into<String>) -> Self {
        AggError::UnknownOperator(name.into())
    }

    pub fn unknown_variable(name: impl Into<String>) -> Self {
        AggError::UnknownVariable(name.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        AggError::TypeMismatch(msg.into())
    }

    pub fn unsupported_stage(msg: impl Into<String>) -> Self {
        AggError::UnsupportedStage(msg.into())
    }

    pub fn soft(self) -> Self {
        AggError::Soft(Box::new(self))
    }
}

pub type Result<T> = std::result::Result<T, AggError>;
