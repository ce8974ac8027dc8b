//! Interfaces of the systems the control plane talks to but does not own.

use crate::error::CollaboratorError;
use crate::{Labourer, Task, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// What a labourer receives when one of its tasks is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub task_id: TaskId,
    pub labourer_id: String,
    pub attempt: u32,
    pub payload: Value,
}

impl Invocation {
    pub fn for_task(task: &Task) -> crate::Result<Self> {
        Ok(Invocation {
            task_id: task.task_id.clone(),
            labourer_id: task.labourer_id.clone(),
            attempt: task.attempts,
            payload: task.payload_value()?,
        })
    }
}

/// Starts a labourer without waiting for it to finish.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, labourer: &Labourer, invocation: &Invocation) -> CollaboratorResult<()>;
}

/// Best-effort operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, subject: &str) -> CollaboratorResult<()>;
}

/// Health and runtime signals used while registering labourers.
///
/// Health is an ordinal score, 0 (unusable) to 4 (healthy).
#[async_trait]
pub trait EcologySource: Send + Sync {
    async fn get_labourer_status(&self, labourer: &Labourer) -> CollaboratorResult<u8>;

    /// `None` when the source has no opinion.
    async fn get_average_duration(&self, _labourer: &Labourer) -> CollaboratorResult<Option<u64>> {
        Ok(None)
    }

    /// `None` when the source has no opinion.
    async fn get_max_duration(&self, _labourer: &Labourer) -> CollaboratorResult<Option<u64>> {
        Ok(None)
    }
}

/// Called by the executor side once a task has finished successfully.
#[async_trait]
pub trait CompletionCallback: Send + Sync {
    async fn mark_task_completed(&self, labourer_id: &str, task_id: &str) -> CollaboratorResult<()>;
}
