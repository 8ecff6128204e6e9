use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while submitting tasks or retrieving their results
#[derive(Error, Debug)]
pub enum CeleryError {
    /// Invalid or ambiguous caller input (e.g. task arguments that are not a sequence)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No installed transport satisfies the requested capabilities
    #[error("no transport available: {0}")]
    NoTransportAvailable(String),

    /// Connecting to the broker or backend failed
    #[error("connection error: {0}")]
    Connection(String),

    /// The broker negatively acknowledged a task message.
    ///
    /// The task must be assumed NOT accepted.
    #[error("broker rejected task {task_name} (id {task_id})")]
    Publish { task_id: String, task_name: String },

    /// Status, result or traceback read before the handle observed readiness
    #[error("called {accessor} before task {task_id} was ready")]
    PrematureAccess {
        task_id: String,
        accessor: &'static str,
    },

    /// Polling for a result exceeded the caller's deadline
    #[error("task {task_name}({task_args}) [id {task_id}] did not return after {timeout:?}")]
    ResultTimeout {
        task_id: String,
        task_name: String,
        task_args: String,
        timeout: Duration,
    },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A result body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Runtime transport fault on an established connection
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for task client operations
pub type Result<T> = std::result::Result<T, CeleryError>;
