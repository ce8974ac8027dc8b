use overseer_core::{CollaboratorError, CoreError};
use overseer_persistence::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task {task_id} belongs to labourer {task_labourer}, not {labourer}")]
    LabourerMismatch {
        task_id: String,
        task_labourer: String,
        labourer: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Labourer error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invocation of task {task_id} failed: {source}")]
    Invocation {
        task_id: String,
        #[source]
        source: CollaboratorError,
    },

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ManagerError {
    /// Errors that abort a whole processing cycle instead of a single task.
    /// Labourer protocol violations are fatal, unreadable rows are not.
    pub fn is_fatal(&self) -> bool {
        match self {
            ManagerError::Config(_) | ManagerError::LabourerMismatch { .. } => true,
            ManagerError::Core(e) => !matches!(
                e,
                CoreError::InvalidTask(_) | CoreError::SerializationError(_)
            ),
            _ => false,
        }
    }

    /// Store hiccups that the next cycle will likely not see again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ManagerError::Store(e) if e.is_transient())
    }
}

impl From<config::ConfigError> for ManagerError {
    fn from(err: config::ConfigError) -> Self {
        ManagerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
