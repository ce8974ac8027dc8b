use async_trait::async_trait;
use overseer_core::{CollaboratorError, CollaboratorResult, Invocation, Invoker, Labourer};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// An invocation handed to the in-process worker runtime.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub invocation: Invocation,
    /// Time box of the labourer that owns the task.
    pub limit: Duration,
}

/// [`Invoker`] that hands invocations to a [`crate::WorkerRuntime`] in the
/// same process. Never waits: a full queue is an invocation failure and the
/// lease is left to expire.
#[derive(Clone)]
pub struct LocalInvoker {
    sender: mpsc::Sender<Dispatch>,
}

impl LocalInvoker {
    /// Create an invoker and the receiving end a runtime consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Dispatch>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (LocalInvoker { sender }, receiver)
    }
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(&self, labourer: &Labourer, invocation: &Invocation) -> CollaboratorResult<()> {
        debug!(
            "Queueing task {} for local labourer {}",
            invocation.task_id, labourer.id
        );

        self.sender
            .try_send(Dispatch {
                invocation: invocation.clone(),
                limit: Duration::from_secs(labourer.duration),
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => CollaboratorError::Invocation(format!(
                    "worker queue is full, task {} not accepted",
                    invocation.task_id
                )),
                TrySendError::Closed(_) => {
                    CollaboratorError::Invocation("worker runtime is not running".to_string())
                }
            })
    }
}
