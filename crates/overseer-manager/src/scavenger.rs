use crate::config::ScavengerConfig;
use crate::error::Result;
use crate::task_manager::TaskManager;
use overseer_core::{EcologySource, Labourer, Notifier, Task};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// What happened to one expired task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiredAction {
    /// Parked in the retry table for `delay` seconds.
    Retried { delay: u64 },
    /// Attempts exhausted; moved to the closed table as failed.
    Archived,
}

/// Counts of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub labourers: usize,
    /// Tasks closed by their executor and moved to the closed table.
    pub archived_closed: usize,
    pub moved_to_retry: usize,
    pub archived_expired: usize,
    /// Retry rows put back at the front of the live queue.
    pub requeued: usize,
    /// Failures isolated to a single task or labourer.
    pub errors: usize,
}

/// Reclaims leases whose executors never closed them.
///
/// Per labourer a sweep archives closed tasks, sends every expired task to
/// the retry table or the archive, then drains due retries back into the
/// live queue. Re-running a sweep over unchanged state does nothing.
pub struct Scavenger {
    task_manager: Arc<TaskManager>,
    ecology: Arc<dyn EcologySource>,
    notifier: Arc<dyn Notifier>,
    config: ScavengerConfig,
}

impl Scavenger {
    pub fn new(
        task_manager: Arc<TaskManager>,
        ecology: Arc<dyn EcologySource>,
        notifier: Arc<dyn Notifier>,
        config: ScavengerConfig,
    ) -> Self {
        Scavenger {
            task_manager,
            ecology,
            notifier,
            config,
        }
    }

    /// Register this cycle's labourers and sweep them.
    pub async fn run_cycle(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let labourers = self
            .task_manager
            .register_labourers(self.ecology.as_ref())
            .await?;
        let report = self.sweep(&labourers).await?;

        self.task_manager
            .metrics()
            .observe_cycle_duration("scavenger", started.elapsed().as_secs_f64());
        info!("Scavenger sweep finished: {:?}", report);
        Ok(report)
    }

    /// Sweep registered labourers. Only fatal errors abort the sweep.
    pub async fn sweep(&self, labourers: &[Labourer]) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for labourer in labourers {
            report.labourers += 1;
            if let Err(e) = self.sweep_labourer(labourer, &mut report).await {
                if e.is_fatal() {
                    return Err(e);
                }
                if e.is_transient() {
                    warn!("Sweep of labourer {} failed: {}, retrying next cycle", labourer.id, e);
                } else {
                    error!("Sweep of labourer {} failed: {}", labourer.id, e);
                }
                self.record_error(&mut report);
            }
        }

        Ok(report)
    }

    async fn sweep_labourer(&self, labourer: &Labourer, report: &mut SweepReport) -> Result<()> {
        if self.config.archive_closed_tasks {
            for task in self.task_manager.get_closed_tasks_for_labourer(labourer).await? {
                match self.task_manager.archive_task(&task.task_id).await {
                    Ok(()) => report.archived_closed += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        error!("Failed to archive closed task {}: {}", task.task_id, e);
                        self.record_error(report);
                    }
                }
            }
        }

        let expired = self.task_manager.get_expired_tasks_for_labourer(labourer).await?;
        if !expired.is_empty() {
            info!(
                "Labourer {} has {} expired tasks",
                labourer.id,
                expired.len()
            );
        }

        for task in &expired {
            match self.process_expired_task(labourer, task).await {
                Ok(ExpiredAction::Retried { .. }) => report.moved_to_retry += 1,
                Ok(ExpiredAction::Archived) => report.archived_expired += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Failed to process expired task {}: {}", task.task_id, e);
                    self.record_error(report);
                }
            }
        }

        report.requeued += self.retry_tasks(labourer).await?;
        Ok(())
    }

    pub fn should_retry_task(&self, labourer: &Labourer, task: &Task) -> bool {
        task.attempts < labourer.max_attempts
    }

    /// Retry an expired task with a delay that grows with its attempts, or
    /// archive it once attempts are exhausted.
    pub async fn process_expired_task(&self, labourer: &Labourer, task: &Task) -> Result<ExpiredAction> {
        if self.should_retry_task(labourer, task) {
            let delay = labourer.max_duration_or_default() * u64::from(task.attempts);
            self.task_manager.move_task_to_retry_table(task, delay).await?;
            return Ok(ExpiredAction::Retried { delay });
        }

        if self.config.notify_on_archive {
            let message = format!(
                "Task {} of labourer {} expired after {} attempts and is archived as failed",
                task.task_id, labourer.id, task.attempts
            );
            if let Err(e) = self.notifier.send(&message, "Task archived").await {
                warn!("Failed to send notification for task {}: {}", task.task_id, e);
            }
        }

        self.task_manager.archive_task(&task.task_id).await?;
        Ok(ExpiredAction::Archived)
    }

    /// Move due retry rows of one labourer back to the live queue.
    pub async fn retry_tasks(&self, labourer: &Labourer) -> Result<usize> {
        let due = self
            .task_manager
            .get_tasks_to_retry_for_labourer(labourer, Some(self.config.retry_batch_limit))
            .await?;
        self.task_manager.retry_tasks(labourer, due).await
    }

    fn record_error(&self, report: &mut SweepReport) {
        report.errors += 1;
        self.task_manager.metrics().inc_cycle_errors("scavenger");
    }
}
