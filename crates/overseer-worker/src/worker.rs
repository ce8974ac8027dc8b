use crate::{config::WorkerConfig, executor::TaskExecutor, handler::TaskHandlerRegistry, invoker::Dispatch};
use overseer_core::{CompletionCallback, TaskId};

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, Semaphore};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Executes invocations received from a [`crate::LocalInvoker`].
///
/// Successful tasks are reported through the completion callback. Failed or
/// timed out tasks are only logged: their lease expires and the scavenger
/// decides whether to retry them.
pub struct WorkerRuntime {
    config: WorkerConfig,
    worker_id: String,
    registry: Arc<TaskHandlerRegistry>,
    completion: Arc<dyn CompletionCallback>,
    in_flight: Arc<DashMap<TaskId, Instant>>,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl WorkerRuntime {
    pub fn new(
        config: WorkerConfig,
        registry: TaskHandlerRegistry,
        completion: Arc<dyn CompletionCallback>,
    ) -> Self {
        let worker_id = config.generate_worker_id();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

        WorkerRuntime {
            config,
            worker_id,
            registry: Arc::new(registry),
            completion,
            in_flight: Arc::new(DashMap::new()),
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of invocations currently executing
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Ids of the tasks currently executing
    pub fn in_flight(&self) -> Vec<TaskId> {
        self.in_flight.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Consume invocations until the channel closes or shutdown is requested
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<Dispatch>) -> anyhow::Result<()> {
        info!(
            "Starting worker {} (concurrency: {})",
            self.worker_id, self.config.concurrency
        );

        loop {
            tokio::select! {
                dispatch = receiver.recv() => {
                    let Some(dispatch) = dispatch else {
                        info!("Invocation channel closed");
                        break;
                    };
                    self.spawn_task(dispatch).await?;
                }

                _ = self.shutdown.notified() => {
                    info!("Worker shutting down gracefully");
                    // Invocations already accepted still run.
                    receiver.close();
                    while let Some(dispatch) = receiver.recv().await {
                        self.spawn_task(dispatch).await?;
                    }
                    break;
                }
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    async fn spawn_task(self: &Arc<Self>, dispatch: Dispatch) -> anyhow::Result<()> {
        let permit = self.permits.clone().acquire_owned().await?;
        self.in_flight
            .insert(dispatch.invocation.task_id.clone(), Instant::now());

        let worker = self.clone();
        tokio::spawn(async move {
            worker.execute_task(dispatch).await;
            drop(permit);
        });
        Ok(())
    }

    async fn execute_task(&self, dispatch: Dispatch) {
        let invocation = dispatch.invocation;
        let task_id = invocation.task_id.clone();

        match self.registry.get(&invocation.labourer_id) {
            Some(handler) => {
                let executor = TaskExecutor::new(handler);
                let result = executor
                    .execute_with_recovery(&invocation, dispatch.limit)
                    .await;

                match result {
                    Ok(_) => {
                        if let Err(e) = self
                            .completion
                            .mark_task_completed(&invocation.labourer_id, &task_id)
                            .await
                        {
                            error!("Failed to report completion of task {}: {}", task_id, e);
                        }
                    }
                    Err(e) => {
                        warn!("Task {} failed and is left for the scavenger: {}", task_id, e);
                    }
                }
            }
            None => {
                error!(
                    "No handler registered for labourer {}, task {} left to expire",
                    invocation.labourer_id, task_id
                );
            }
        }

        if let Some((_, started)) = self.in_flight.remove(&task_id) {
            debug!("Task {} ran for {:?}", task_id, started.elapsed());
        }
    }

    /// Wait for in-flight tasks to complete, up to the configured deadline
    async fn graceful_shutdown(&self) {
        info!("Waiting for active tasks to complete...");

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.graceful_shutdown_timeout_secs);

        loop {
            let active = self.active_count();

            if active == 0 {
                info!("All tasks completed, shutting down");
                break;
            }

            if tokio::time::Instant::now() > deadline {
                warn!("Shutdown deadline exceeded, {} tasks still active", active);
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EchoHandler, SleepHandler};
    use crate::invoker::LocalInvoker;
    use async_trait::async_trait;
    use overseer_core::{
        CollaboratorResult, Invocation, Invoker, Labourer, LabourerAttributes,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingCallback {
        completed: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CompletionCallback for RecordingCallback {
        async fn mark_task_completed(&self, labourer_id: &str, task_id: &str) -> CollaboratorResult<()> {
            self.completed
                .lock()
                .push((labourer_id.to_string(), task_id.to_string()));
            Ok(())
        }
    }

    fn labourer(id: &str, duration: u64) -> Labourer {
        Labourer::new(
            id,
            LabourerAttributes {
                duration: Some(duration),
                ..LabourerAttributes::default()
            },
        )
        .unwrap()
    }

    fn invocation(task_id: &str, labourer_id: &str) -> Invocation {
        Invocation {
            task_id: task_id.to_string(),
            labourer_id: labourer_id.to_string(),
            attempt: 1,
            payload: json!({"task": task_id}),
        }
    }

    async fn wait_for(callback: &RecordingCallback, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while callback.completed.lock().len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_runtime_reports_completed_tasks() {
        let registry = TaskHandlerRegistry::new();
        registry.register("echo", EchoHandler);

        let callback = Arc::new(RecordingCallback::default());
        let (invoker, receiver) = LocalInvoker::channel(8);
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerConfig::default(),
            registry,
            callback.clone(),
        ));
        let handle = tokio::spawn(runtime.clone().run(receiver));

        let echo = labourer("echo", 10);
        invoker.invoke(&echo, &invocation("t1", "echo")).await.unwrap();
        invoker.invoke(&echo, &invocation("t2", "echo")).await.unwrap();

        wait_for(&callback, 2).await;
        let mut completed = callback.completed.lock().clone();
        completed.sort();
        assert_eq!(
            completed,
            vec![
                ("echo".to_string(), "t1".to_string()),
                ("echo".to_string(), "t2".to_string()),
            ]
        );

        runtime.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_and_unknown_tasks_are_not_completed() {
        let registry = TaskHandlerRegistry::new();
        registry.register("slow", SleepHandler::new(2000));
        registry.register("echo", EchoHandler);

        let callback = Arc::new(RecordingCallback::default());
        let (invoker, receiver) = LocalInvoker::channel(8);
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerConfig::default(),
            registry,
            callback.clone(),
        ));
        let handle = tokio::spawn(runtime.clone().run(receiver));

        // Zero-second limit: the sleeping handler always times out.
        let mut slow = labourer("slow", 1);
        slow.duration = 0;
        invoker.invoke(&slow, &invocation("t-slow", "slow")).await.unwrap();
        invoker
            .invoke(&labourer("ghost", 10), &invocation("t-ghost", "ghost"))
            .await
            .unwrap();
        invoker
            .invoke(&labourer("echo", 10), &invocation("t-echo", "echo"))
            .await
            .unwrap();

        wait_for(&callback, 1).await;
        drop(invoker);
        handle.await.unwrap().unwrap();

        assert_eq!(
            callback.completed.lock().clone(),
            vec![("echo".to_string(), "t-echo".to_string())]
        );
        assert_eq!(runtime.active_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_runs_accepted_invocations() {
        let registry = TaskHandlerRegistry::new();
        registry.register("echo", EchoHandler);

        let callback = Arc::new(RecordingCallback::default());
        let (invoker, receiver) = LocalInvoker::channel(8);
        let runtime = Arc::new(WorkerRuntime::new(
            WorkerConfig::default(),
            registry,
            callback.clone(),
        ));

        let echo = labourer("echo", 10);
        invoker.invoke(&echo, &invocation("t1", "echo")).await.unwrap();
        invoker.invoke(&echo, &invocation("t2", "echo")).await.unwrap();

        runtime.shutdown();
        runtime.clone().run(receiver).await.unwrap();

        assert_eq!(callback.completed.lock().len(), 2);
        assert!(invoker.invoke(&echo, &invocation("t3", "echo")).await.is_err());
    }
}
