use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SpindleError>;

/// Errors surfaced by planning, rewriting and execution.
#[derive(Debug, Error)]
pub enum SpindleError {
    /// Invalid plan shape or caller input.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid plan shape or caller input with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A rewrite broke a plan invariant. Always fatal.
    #[error("internal error: {0}")]
    Internal(String),
    /// Failure reported by a storage or index collaborator, passed through verbatim.
    #[error("storage: {0}")]
    Storage(String),
    /// I/O failure while reading plans, datasets or configuration.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// JSON (de)serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// A bind parameter referenced by the plan was not supplied.
    #[error("bind parameter '{0}' was not supplied")]
    BindParameterMissing(String),
    /// Named collection, view or index does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The caller aborted the query between two pulls.
    #[error("query aborted")]
    Aborted,
}

impl SpindleError {
    /// Builds an [`SpindleError::Internal`] from anything printable.
    pub fn internal(msg: impl Into<String>) -> Self {
        SpindleError::Internal(msg.into())
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            SpindleError::Invalid(_) | SpindleError::InvalidOwned(_) => "Invalid",
            SpindleError::Internal(_) => "Internal",
            SpindleError::Storage(_) => "Storage",
            SpindleError::Io(_) => "Io",
            SpindleError::Json(_) => "Json",
            SpindleError::Config(_) => "Config",
            SpindleError::BindParameterMissing(_) => "BindParameterMissing",
            SpindleError::NotFound(_) => "NotFound",
            SpindleError::Aborted => "Aborted",
        }
    }
}
