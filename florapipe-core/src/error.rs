//! Error types for florapipe pipelines

use std::io;
use thiserror::Error;

/// Result type for florapipe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for florapipe operations
///
/// Every variant is fatal to the run: configuration errors abort before any
/// data processing starts, contract violations surface at the offending
/// stage, and resource errors propagate to the driver.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration or directive
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `target` identifier that no registered constructor matches
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// An `instance` reference to a name not yet in the registry
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    /// Constructor argument mismatch while instantiating a target
    #[error("cannot construct '{target}': {reason}")]
    Construction {
        /// The dotted target identifier being constructed
        target: String,
        /// Why construction failed
        reason: String,
    },

    /// A stage precondition was not met (missing field, length mismatch)
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A required record field was absent when a stage executed
    #[error("missing required field '{field}' in {stage}")]
    MissingField {
        /// The stage that required the field
        stage: String,
        /// The absent field name
        field: String,
    },

    /// Dataset file missing, image unreadable, and similar
    #[error("resource error: {0}")]
    Resource(String),

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parse or serialize error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error with a formatted message
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Shorthand for a contract violation with a formatted message
    pub fn contract(msg: impl Into<String>) -> Self {
        Error::ContractViolation(msg.into())
    }

    /// Shorthand for a resource error with a formatted message
    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }
}
