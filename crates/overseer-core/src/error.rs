use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid timestamp name: {0} (expected one of start, invoked, expired)")]
    InvalidTimestamp(String),

    #[error("Labourer {labourer_id} has no '{name}' timestamp yet, register it first")]
    NotRegistered { labourer_id: String, name: &'static str },

    #[error("Labourer {labourer_id} already has '{name}' set")]
    TimestampAlreadySet { labourer_id: String, name: &'static str },

    #[error("Unexpected labourer attribute: {0}")]
    UnexpectedAttribute(String),

    #[error("Invalid labourer attribute {name}: {reason}")]
    InvalidAttribute { name: String, reason: String },

    #[error("Invalid task row: {0}")]
    InvalidTask(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures reported by invokers, notifiers and ecology sources.
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Ecology unavailable: {0}")]
    Ecology(String),

    #[error("Completion callback failed: {0}")]
    Completion(String),
}
