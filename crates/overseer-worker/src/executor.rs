use crate::handler::{TaskHandler, TaskResult};
use overseer_core::Invocation;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

/// Runs a handler under the labourer's time box
pub struct TaskExecutor {
    handler: Arc<dyn TaskHandler>,
}

impl TaskExecutor {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        TaskExecutor { handler }
    }

    /// Execute an invocation, failing once `limit` has elapsed
    pub async fn execute(&self, invocation: &Invocation, limit: Duration) -> TaskResult {
        let task_id = &invocation.task_id;
        info!(
            "Executing task {} of labourer {} (attempt {}, limit {:?})",
            task_id, invocation.labourer_id, invocation.attempt, limit
        );

        match timeout(limit, self.handler.execute(invocation)).await {
            Ok(Ok(result)) => {
                info!("Task {} completed successfully", task_id);
                Ok(result)
            }
            Ok(Err(e)) => {
                error!("Task {} failed: {}", task_id, e);
                Err(e)
            }
            Err(_) => {
                error!("Task {} timed out after {:?}", task_id, limit);
                Err(format!("Task execution timed out after {:?}", limit))
            }
        }
    }

    /// Execute on a separate task so a panicking handler becomes an error
    pub async fn execute_with_recovery(&self, invocation: &Invocation, limit: Duration) -> TaskResult {
        let executor = TaskExecutor::new(self.handler.clone());
        let owned = invocation.clone();

        match tokio::spawn(async move { executor.execute(&owned, limit).await }).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_panic() {
                    error!("Task {} panicked: {:?}", invocation.task_id, e);
                    Err("Task panicked during execution".to_string())
                } else {
                    error!("Task {} was cancelled", invocation.task_id);
                    Err("Task was cancelled".to_string())
                }
            }
        }
    }
}
