//! Error handling for the Play engine
//!
//! Every fallible operation in the library returns [`EngineError`]. The variants
//! follow the engine's failure taxonomy: configuration, provisioning and
//! submission failures end a Play in phase `Error`; persistence conflicts are
//! retried by requeueing the reconciliation.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// The Play itself is malformed (no `main` screenplay, bad frame, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A vars config object or a volume could not be provisioned
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The scheduler backend could not create or recover a job
    #[error("Submission error: {0}")]
    Submission(String),

    /// An optimistic-concurrency write lost the race against another writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Illegal phase transition
    #[error("Phase transition error: {0}")]
    Transition(String),

    /// Internal state errors (poisoned locks, closed channels)
    #[error("State error: {0}")]
    State(String),

    /// IO errors (file store, child processes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a submission error
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::Submission(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already-exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Returns true for errors that a later reconciliation may resolve on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Io(_) | Self::State(_))
    }

    /// Returns true for "already exists" responses, which provisioning treats as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns true when the error is a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::State(format!("lock poisoned: {}", err))
    }
}
