use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::task_manager::{InvokeOutcome, InvokeTarget, TaskManager};
use futures::future::join_all;
use overseer_core::{EcologySource, Labourer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Counts of one orchestration cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestrationReport {
    pub labourers: usize,
    pub invoked: usize,
    /// Lease races lost to another orchestrator.
    pub skipped: usize,
    pub errors: usize,
}

/// Pulls queued tasks and invokes as many as each labourer's health allows.
pub struct Orchestrator {
    task_manager: Arc<TaskManager>,
    ecology: Arc<dyn EcologySource>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        task_manager: Arc<TaskManager>,
        ecology: Arc<dyn EcologySource>,
        config: OrchestratorConfig,
    ) -> Self {
        Orchestrator {
            task_manager,
            ecology,
            config,
        }
    }

    pub async fn run_cycle(&self) -> Result<OrchestrationReport> {
        let started = Instant::now();
        let labourers = self
            .task_manager
            .register_labourers(self.ecology.as_ref())
            .await?;
        let report = self.invoke(&labourers).await?;

        self.task_manager
            .metrics()
            .observe_cycle_duration("orchestrator", started.elapsed().as_secs_f64());
        info!("Orchestration cycle finished: {:?}", report);
        Ok(report)
    }

    /// Invoke tasks for registered labourers. Failures of one labourer are
    /// logged and counted; fatal errors abort the cycle.
    pub async fn invoke(&self, labourers: &[Labourer]) -> Result<OrchestrationReport> {
        let mut report = OrchestrationReport::default();

        for labourer in labourers {
            report.labourers += 1;
            if let Err(e) = self.invoke_for_labourer(labourer, &mut report).await {
                if e.is_fatal() {
                    return Err(e);
                }
                if e.is_transient() {
                    warn!("Orchestration of labourer {} failed: {}, retrying next cycle", labourer.id, e);
                } else {
                    error!("Orchestration of labourer {} failed: {}", labourer.id, e);
                }
                self.record_error(&mut report);
            }
        }

        Ok(report)
    }

    async fn invoke_for_labourer(&self, labourer: &Labourer, report: &mut OrchestrationReport) -> Result<()> {
        let metrics = self.task_manager.metrics();
        let queue_length = self
            .task_manager
            .get_length_of_queue_for_labourer(labourer)
            .await?;
        metrics
            .queue_length
            .with_label_values(&[labourer.id.as_str()])
            .set(queue_length as i64);

        let desired = self.get_desired_invocation_number_for_labourer(labourer).await?;
        if desired == 0 {
            debug!("Nothing to invoke for labourer {}", labourer.id);
            return Ok(());
        }

        let tasks = self
            .task_manager
            .get_next_for_labourer(labourer, desired)
            .await?;
        // Each lease is its own conditional write.
        let outcomes = join_all(tasks.into_iter().map(|task| async move {
            let task_id = task.task_id.clone();
            let outcome = self
                .task_manager
                .invoke_task(labourer, InvokeTarget::Task(task))
                .await;
            (task_id, outcome)
        }))
        .await;

        for (task_id, outcome) in outcomes {
            match outcome {
                Ok(InvokeOutcome::Invoked(_)) => report.invoked += 1,
                Ok(InvokeOutcome::Skipped) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to invoke task {}: {}", task_id, e);
                    self.record_error(report);
                }
            }
        }

        Ok(())
    }

    /// How many tasks to invoke now: the health-scaled share of the
    /// labourer's simultaneous invocations minus what is already running,
    /// capped per cycle.
    pub async fn get_desired_invocation_number_for_labourer(&self, labourer: &Labourer) -> Result<usize> {
        let health = usize::from(labourer.health.unwrap_or(0));
        let coefficient = self
            .config
            .health_coefficients
            .get(health)
            .or(self.config.health_coefficients.last())
            .copied()
            .unwrap_or(0.0);
        let max_simultaneous = labourer
            .max_simultaneous_invocations
            .unwrap_or(self.config.default_max_simultaneous_invocations);

        let running = self
            .task_manager
            .get_count_of_running_tasks_for_labourer(labourer)
            .await?;
        self.task_manager
            .metrics()
            .running_tasks
            .with_label_values(&[labourer.id.as_str()])
            .set(running as i64);

        let allowed = (f64::from(max_simultaneous) * coefficient).floor() as usize;
        let desired = allowed
            .saturating_sub(running)
            .min(self.config.max_invocations_per_cycle as usize);

        debug!(
            "Labourer {}: health {}, allowed {}, running {}, desired {}",
            labourer.id, health, allowed, running, desired
        );
        Ok(desired)
    }

    fn record_error(&self, report: &mut OrchestrationReport) {
        report.errors += 1;
        self.task_manager.metrics().inc_cycle_errors("orchestrator");
    }
}
