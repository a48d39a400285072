//! Error types for the NEData cache service

use thiserror::Error;

use crate::cache::Id;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache service
///
/// Lookups never produce one of these; absence is reported in-band. These
/// are reserved for misuse of the scheduling API and for configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Contract Violations
    // =========================================================================
    /// Function ID was never registered
    #[error("Unknown function: {0}")]
    UnknownFunction(Id),

    /// Input ID does not refer to a cached value
    #[error("Unknown or evicted value ID: {0}")]
    UnknownId(Id),

    /// Task ID does not refer to a live task
    #[error("Unknown task: {0}")]
    UnknownTask(Id),

    /// Input count does not match the function's declared arity
    #[error("Function {function} expects {expected} inputs, got {actual}")]
    ArityMismatch {
        function: Id,
        expected: usize,
        actual: usize,
    },

    /// Dependency registered on a task that is no longer deferred
    #[error("Task {task} is not an unqueued deferred task")]
    NotDeferred { task: Id },

    /// A function body handed back a deferral it did not create
    #[error("Task {task} was not deferred by the returning function")]
    InvalidDeferral { task: Id },

    /// A deferred task was asked to wait on itself
    #[error("Task {task} cannot wait for itself")]
    SelfDependency { task: Id },

    /// Page sharing is statically disabled for this store
    #[error("Page sharing is disabled for this store")]
    SharingDisabled,

    /// Page index past the end of the page table
    #[error("Page {page} is out of range ({pages} pages)")]
    PageOutOfRange { page: usize, pages: usize },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Function body reported a failure
    #[error("Task {task} failed: {reason}")]
    TaskFailed { task: Id, reason: String },

    /// Function body reported a failure (raised from inside the body)
    #[error("Function failed: {0}")]
    FunctionFailed(String),

    /// Service has been shut down
    #[error("Cache service has been shut down")]
    ShutDown,

    /// Worker thread could not be started
    #[error("Worker error: {0}")]
    Worker(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
