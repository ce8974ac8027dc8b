//! The queue engine.
//!
//! Every task row carries a `greenfield` that is both its queue position and
//! its lease state. Against a registered [`Labourer`] window
//! (`start < expired < invoked`):
//!
//! * `greenfield < start`: queued, served in ascending order
//! * `start <= greenfield <= expired`: leased so long ago the lease is dead
//! * `expired <= greenfield <= invoked`: leased and still running
//! * `greenfield >= invoked`: leased during this cycle
//!
//! Leasing bumps the greenfield to `now + invocation delta` with a
//! conditional write, which is the only mutual exclusion in the system.

use crate::config::TaskManagerConfig;
use crate::error::{ManagerError, Result};
use crate::metrics::ControlMetrics;
use async_trait::async_trait;
use overseer_core::{
    fields, status_key, ClosedTask, Clock, CollaboratorError, CollaboratorResult,
    CompletionCallback, EcologySource, Invocation, Invoker, Labourer, RetryTask, Row,
    SystemClock, Task, TaskId, WindowState,
};
use overseer_persistence::{Condition, IndexedStore, Query, Update, UpdateOutcome, WriteOp};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which task `invoke_task` should lease.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeTarget {
    /// Fetch the task by id first.
    Id(TaskId),
    Task(Task),
}

impl From<Task> for InvokeTarget {
    fn from(task: Task) -> Self {
        InvokeTarget::Task(task)
    }
}

/// Result of the lease primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// The lease is ours; carries the task as stored after the bump.
    Acquired(Task),
    /// Somebody else moved the greenfield first.
    AlreadyLeased,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Invoked(Task),
    /// Lost the lease race; nothing was invoked.
    Skipped,
}

pub struct TaskManager {
    config: TaskManagerConfig,
    store: Arc<dyn IndexedStore>,
    invoker: Arc<dyn Invoker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ControlMetrics>,
}

/// Assembles a [`TaskManager`] from already constructed collaborators.
#[derive(Default)]
pub struct TaskManagerBuilder {
    config: Option<TaskManagerConfig>,
    store: Option<Arc<dyn IndexedStore>>,
    invoker: Option<Arc<dyn Invoker>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<ControlMetrics>>,
}

impl TaskManagerBuilder {
    pub fn config(mut self, config: TaskManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn IndexedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ControlMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<TaskManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .ok_or_else(|| ManagerError::Config("task manager needs a store".to_string()))?;
        let invoker = self
            .invoker
            .ok_or_else(|| ManagerError::Config("task manager needs an invoker".to_string()))?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                ControlMetrics::new().map_err(|e| ManagerError::Runtime(e.to_string()))?,
            ),
        };

        Ok(TaskManager {
            config,
            store,
            invoker,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            metrics,
        })
    }
}

impl TaskManager {
    pub fn builder() -> TaskManagerBuilder {
        TaskManagerBuilder::default()
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ControlMetrics> {
        &self.metrics
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Build this cycle's labourers from configuration.
    ///
    /// Each labourer gets a fresh window, a health score from the ecology and
    /// duration estimates from the ecology or, failing that, from recently
    /// closed tasks. The result is meant to be passed to every later call of
    /// the same cycle.
    pub async fn register_labourers(&self, ecology: &dyn EcologySource) -> Result<Vec<Labourer>> {
        let now = self.clock.now();
        let mut labourers = Vec::with_capacity(self.config.labourers.len());

        for labourer_config in &self.config.labourers {
            let mut attributes = labourer_config.attributes();
            attributes.max_attempts = attributes
                .max_attempts
                .or(Some(self.config.default_max_attempts));

            let mut labourer = Labourer::new(labourer_config.id.clone(), attributes)?;
            labourer.register(now, self.config.greenfield_invocation_delta)?;

            labourer.health = Some(match ecology.get_labourer_status(&labourer).await {
                Ok(health) => health,
                Err(e) => {
                    warn!("No health for labourer {}, treating as dead: {}", labourer.id, e);
                    0
                }
            });

            labourer.average_duration = match ecology.get_average_duration(&labourer).await {
                Ok(Some(duration)) => Some(duration),
                Ok(None) => Some(self.get_average_labourer_duration(&labourer).await?),
                Err(e) => {
                    warn!("Ecology has no average duration for {}: {}", labourer.id, e);
                    Some(self.get_average_labourer_duration(&labourer).await?)
                }
            };

            labourer.max_duration = match ecology.get_max_duration(&labourer).await {
                Ok(Some(duration)) => Some(duration),
                Ok(None) => Some(self.get_max_labourer_duration(&labourer).await?),
                Err(e) => {
                    warn!("Ecology has no max duration for {}: {}", labourer.id, e);
                    Some(self.get_max_labourer_duration(&labourer).await?)
                }
            };

            debug!(
                "Registered labourer {} (health {:?}, start {})",
                labourer.id, labourer.health, now
            );
            labourers.push(labourer);
        }

        Ok(labourers)
    }

    /// Create a task at the back of the labourer's queue.
    ///
    /// Missing required columns are generated. Object and array values are
    /// stored as JSON strings. Returns the id of the new task.
    pub async fn create_task(&self, labourer: &Labourer, task_fields: Row) -> Result<TaskId> {
        let mut row = Row::new();
        for (column, value) in task_fields {
            let value = match value {
                Value::Object(_) | Value::Array(_) => Value::String(serde_json::to_string(&value)?),
                other => other,
            };
            row.insert(column, value);
        }

        let required = self
            .config
            .required_fields
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(fields::ATTEMPTS));

        for column in required {
            if row.get(column).map_or(false, |value| !value.is_null()) {
                continue;
            }
            let value = self.generate_field(column, labourer).await?.ok_or_else(|| {
                ManagerError::Config(format!(
                    "required field {} has no value and no generator",
                    column
                ))
            })?;
            row.insert(column.to_string(), value);
        }

        let task = Task::from_row(row.clone())?;
        self.store.put(&self.config.table_name, row).await?;
        self.metrics.inc_tasks_total("created", &labourer.id);

        debug!(
            "Created task {} for labourer {} at greenfield {}",
            task.task_id, labourer.id, task.greenfield
        );
        Ok(task.task_id)
    }

    async fn generate_field(&self, column: &str, labourer: &Labourer) -> Result<Option<Value>> {
        Ok(match column {
            fields::TASK_ID => Some(Value::from(uuid::Uuid::new_v4().to_string())),
            fields::LABOURER_ID => Some(Value::from(labourer.id.as_str())),
            fields::CREATED_AT => Some(Value::from(self.clock.now())),
            fields::GREENFIELD => {
                let newest = self.get_newest_greenfield_for_labourer(labourer).await?;
                Some(Value::from(newest + self.config.greenfield_task_step))
            }
            fields::ATTEMPTS => Some(Value::from(0)),
            _ => None,
        })
    }

    pub async fn get_task_by_id(&self, task_id: &str) -> Result<Option<Task>> {
        let row = self
            .store
            .get(&self.config.table_name, &Value::from(task_id))
            .await?;
        Ok(row.map(Task::from_row).transpose()?)
    }

    /// A live task together with where its greenfield sits in the
    /// labourer's window. `None` once the task has left the live table.
    pub async fn get_task_state(
        &self,
        labourer: &Labourer,
        task_id: &str,
    ) -> Result<Option<(Task, WindowState)>> {
        let Some(task) = self.get_task_by_id(task_id).await? else {
            return Ok(None);
        };
        if task.labourer_id != labourer.id {
            return Err(ManagerError::LabourerMismatch {
                task_id: task.task_id,
                task_labourer: task.labourer_id,
                labourer: labourer.id.clone(),
            });
        }

        let state = labourer.window_state(task.greenfield)?;
        Ok(Some((task, state)))
    }

    /// Fetch many tasks, retrying keys the store left unprocessed with
    /// exponential backoff. Missing tasks are simply absent from the result.
    pub async fn get_tasks_by_ids(&self, task_ids: &[TaskId]) -> Result<Vec<Task>> {
        let mut pending: Vec<Value> = task_ids.iter().map(|id| Value::from(id.as_str())).collect();
        let mut tasks = Vec::with_capacity(pending.len());
        let mut retries = 0;

        while !pending.is_empty() {
            let response = self
                .store
                .batch_get(&self.config.table_name, &pending)
                .await?;
            tasks.extend(self.parse_rows(&self.config.table_name, response.rows, Task::from_row));

            pending = response.unprocessed;
            if pending.is_empty() {
                break;
            }

            if retries >= self.config.batch_get_max_retries {
                return Err(ManagerError::Runtime(format!(
                    "{} keys still unprocessed after {} retries",
                    pending.len(),
                    retries
                )));
            }

            let backoff = self.config.batch_get_backoff_ms.saturating_mul(1 << retries);
            debug!(
                "{} keys unprocessed, retrying in {} ms",
                pending.len(),
                backoff
            );
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            retries += 1;
        }

        Ok(tasks)
    }

    fn greenfield_query(&self, labourer: &Labourer) -> Query {
        Query::new(&self.config.table_name, labourer.id.as_str()).index(&self.config.greenfield_index)
    }

    /// Greenfield of the front of the queue (the back when `reverse`), or
    /// the step sentinel when the queue is empty.
    pub async fn get_oldest_greenfield_for_labourer(
        &self,
        labourer: &Labourer,
        reverse: bool,
    ) -> Result<i64> {
        let mut query = self
            .greenfield_query(labourer)
            .range(Condition::le(fields::GREENFIELD, self.clock.now()))
            .limit(1);
        if reverse {
            query = query.descending();
        }

        let rows = self.store.query(&query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(fields::GREENFIELD))
            .and_then(Value::as_i64)
            .unwrap_or(self.config.greenfield_task_step))
    }

    pub async fn get_newest_greenfield_for_labourer(&self, labourer: &Labourer) -> Result<i64> {
        self.get_oldest_greenfield_for_labourer(labourer, true).await
    }

    pub async fn get_length_of_queue_for_labourer(&self, labourer: &Labourer) -> Result<usize> {
        let query = self
            .greenfield_query(labourer)
            .range(Condition::le(fields::GREENFIELD, self.clock.now()));
        Ok(self.store.count(&query).await?)
    }

    /// Up to `count` queued tasks, front of the queue first. Read only.
    pub async fn get_next_for_labourer(&self, labourer: &Labourer, count: usize) -> Result<Vec<Task>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let query = self
            .greenfield_query(labourer)
            .range(Condition::lt(fields::GREENFIELD, labourer.start()?))
            .limit(count);
        self.tasks(query).await
    }

    /// Lease a task and hand it to the invoker.
    ///
    /// Losing the lease race is not an error: the skip is counted and
    /// [`InvokeOutcome::Skipped`] returned. If the invoker fails after the
    /// lease was taken the lease stays and the task expires normally.
    pub async fn invoke_task(&self, labourer: &Labourer, target: InvokeTarget) -> Result<InvokeOutcome> {
        let task = match target {
            InvokeTarget::Id(task_id) => self
                .get_task_by_id(&task_id)
                .await?
                .ok_or(ManagerError::TaskNotFound(task_id))?,
            InvokeTarget::Task(task) => task,
        };

        let leased = match self.mark_task_invoked(labourer, &task, true).await {
            Ok(LeaseOutcome::Acquired(leased)) => leased,
            Ok(LeaseOutcome::AlreadyLeased) => {
                info!(
                    "Task {} was already leased by another invoker, skipping",
                    task.task_id
                );
                self.metrics.concurrent_task_invocations_skipped.inc();
                return Ok(InvokeOutcome::Skipped);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                return Err(ManagerError::Runtime(format!(
                    "failed to lease task {}: {}",
                    task.task_id, e
                )))
            }
        };

        let invocation = Invocation::for_task(&leased)?;
        self.invoker
            .invoke(labourer, &invocation)
            .await
            .map_err(|source| ManagerError::Invocation {
                task_id: leased.task_id.clone(),
                source,
            })?;

        self.metrics.inc_tasks_total("invoked", &labourer.id);
        debug!(
            "Invoked task {} (attempt {}) on labourer {}",
            leased.task_id, leased.attempts, labourer.id
        );
        Ok(InvokeOutcome::Invoked(leased))
    }

    /// Take the lease on `task`: move its greenfield to `now + delta` and
    /// count the attempt.
    ///
    /// With `check_running` the write only happens while the stored
    /// greenfield is still below `labourer.start`; otherwise the row only
    /// has to exist.
    pub async fn mark_task_invoked(
        &self,
        labourer: &Labourer,
        task: &Task,
        check_running: bool,
    ) -> Result<LeaseOutcome> {
        if task.labourer_id != labourer.id {
            return Err(ManagerError::LabourerMismatch {
                task_id: task.task_id.clone(),
                task_labourer: task.labourer_id.clone(),
                labourer: labourer.id.clone(),
            });
        }

        let condition = if check_running {
            Condition::lt(fields::GREENFIELD, labourer.start()?)
        } else {
            Condition::exists(fields::TASK_ID)
        };

        let update = Update::new(&self.config.table_name, task.task_id.as_str())
            .set(
                fields::GREENFIELD,
                self.clock.now() + self.config.greenfield_invocation_delta,
            )
            .increment(fields::ATTEMPTS, 1)
            .condition(condition);

        match self.store.update(&update).await? {
            UpdateOutcome::Applied(row) => Ok(LeaseOutcome::Acquired(Task::from_row(row)?)),
            UpdateOutcome::ConditionFailed => Ok(LeaseOutcome::AlreadyLeased),
        }
    }

    /// Record that the executor finished a task. Returns false when the task
    /// is no longer in the live table.
    pub async fn close_task(&self, task_id: &str, completed: bool) -> Result<bool> {
        let now = self.clock.now();
        let mut update = Update::new(&self.config.table_name, task_id)
            .set(fields::CLOSED_AT, now)
            .condition(Condition::exists(fields::TASK_ID));
        if completed {
            update = update.set(fields::COMPLETED_AT, now);
        }

        match self.store.update(&update).await? {
            UpdateOutcome::Applied(_) => {
                debug!("Closed task {} (completed: {})", task_id, completed);
                Ok(true)
            }
            UpdateOutcome::ConditionFailed => {
                warn!("Cannot close task {}, it is not in the live table", task_id);
                Ok(false)
            }
        }
    }

    /// Move a task from the live table to the closed table.
    pub async fn archive_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .get_task_by_id(task_id)
            .await?
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.to_string()))?;
        let labourer_id = task.labourer_id.clone();

        let closed = ClosedTask::close(task, self.clock.now());
        let status = closed.labourer_id_task_status.clone();
        self.relocate(
            &self.config.closed_table_name,
            closed.to_row()?,
            &self.config.table_name,
            task_id,
        )
        .await?;

        self.metrics.inc_tasks_total("archived", &labourer_id);
        info!("Archived task {} as {}", task_id, status);
        Ok(())
    }

    /// Park a task in the retry table until `now + wanted_delay`.
    pub async fn move_task_to_retry_table(&self, task: &Task, wanted_delay: u64) -> Result<()> {
        let desired_launch_time = self.clock.now() + wanted_delay as i64;
        let retry = RetryTask::new(task.clone(), desired_launch_time);

        self.relocate(
            &self.config.retry_table_name,
            retry.to_row()?,
            &self.config.table_name,
            &task.task_id,
        )
        .await?;

        self.metrics.inc_tasks_total("moved_to_retry", &task.labourer_id);
        info!(
            "Task {} will be retried after {} (attempt {})",
            task.task_id, desired_launch_time, task.attempts
        );
        Ok(())
    }

    /// Put into one table and delete from another, in a single transaction
    /// when the store supports it.
    async fn relocate(&self, to_table: &str, row: Row, from_table: &str, task_id: &str) -> Result<()> {
        if self.store.supports_transactions() {
            self.store
                .transact_write(vec![
                    WriteOp::put(to_table, row),
                    WriteOp::delete(from_table, task_id),
                ])
                .await?;
        } else {
            warn!(
                "Store has no transactions, moving task {} from {} to {} in two writes",
                task_id, from_table, to_table
            );
            self.store.put(to_table, row).await?;
            self.store.delete(from_table, &Value::from(task_id)).await?;
        }
        Ok(())
    }

    /// Retry rows whose launch time has come, oldest launch time first.
    pub async fn get_tasks_to_retry_for_labourer(
        &self,
        labourer: &Labourer,
        limit: Option<usize>,
    ) -> Result<Vec<RetryTask>> {
        let mut query = Query::new(&self.config.retry_table_name, labourer.id.as_str())
            .index(&self.config.retry_index)
            .range(Condition::le(fields::DESIRED_LAUNCH_TIME, self.clock.now()));
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        let rows = self.store.query(&query).await?;
        Ok(self.parse_rows(&self.config.retry_table_name, rows, RetryTask::from_row))
    }

    /// Put retried tasks back at the front of the live queue.
    ///
    /// The batch takes the greenfields just below the current front and
    /// keeps its order: for front `G`, `[A, B]` become `A = G - 2` and
    /// `B = G - 1`. Each task is written and removed from the retry table in
    /// the same transaction; transactions are filled up to the store limit.
    pub async fn retry_tasks(&self, labourer: &Labourer, tasks: Vec<RetryTask>) -> Result<usize> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let oldest = self.get_oldest_greenfield_for_labourer(labourer, false).await?;
        let first = oldest - tasks.len() as i64;
        let per_transaction = (self.store.max_transaction_items() / 2).max(1);
        let transactional = self.store.supports_transactions();
        if !transactional {
            warn!(
                "Store has no transactions, retrying {} tasks of {} without atomicity",
                tasks.len(),
                labourer.id
            );
        }

        let mut requeued = 0;
        for (chunk_index, chunk) in tasks.chunks(per_transaction).enumerate() {
            let mut ops = Vec::with_capacity(chunk.len() * 2);
            for (offset, retry) in chunk.iter().enumerate() {
                let position = (chunk_index * per_transaction + offset) as i64;
                let mut task = retry.clone().into_task();
                task.greenfield = first + position;

                ops.push(WriteOp::put(&self.config.table_name, task.to_row()?));
                ops.push(WriteOp::delete(&self.config.retry_table_name, task.task_id.as_str()));
            }

            if transactional {
                self.store.transact_write(ops).await?;
            } else {
                for op in ops {
                    match op {
                        WriteOp::Put { table, row } => self.store.put(&table, row).await?,
                        WriteOp::Delete { table, key } => self.store.delete(&table, &key).await?,
                    }
                }
            }
            requeued += chunk.len();
        }

        for _ in 0..requeued {
            self.metrics.inc_tasks_total("retried", &labourer.id);
        }
        info!(
            "Requeued {} tasks of labourer {} in front of greenfield {}",
            requeued, labourer.id, oldest
        );
        Ok(requeued)
    }

    /// Tasks leased at or after this window's `invoked`. `closed` filters on
    /// `closed_at` presence when given.
    pub async fn get_invoked_tasks_for_labourer(
        &self,
        labourer: &Labourer,
        closed: Option<bool>,
    ) -> Result<Vec<Task>> {
        let mut query = self
            .greenfield_query(labourer)
            .range(Condition::ge(fields::GREENFIELD, labourer.invoked()?));
        query = match closed {
            Some(true) => query.filter(Condition::exists(fields::CLOSED_AT)),
            Some(false) => query.filter(Condition::not_exists(fields::CLOSED_AT)),
            None => query,
        };
        self.tasks(query).await
    }

    fn running_query(&self, labourer: &Labourer) -> Result<Query> {
        Ok(self
            .greenfield_query(labourer)
            .range(Condition::between(
                fields::GREENFIELD,
                labourer.expired()?,
                labourer.invoked()?,
            ))
            .filter(Condition::not_exists(fields::CLOSED_AT)))
    }

    /// Open leases still inside duration + cooldown.
    pub async fn get_running_tasks_for_labourer(&self, labourer: &Labourer) -> Result<Vec<Task>> {
        self.tasks(self.running_query(labourer)?).await
    }

    pub async fn get_count_of_running_tasks_for_labourer(&self, labourer: &Labourer) -> Result<usize> {
        Ok(self.store.count(&self.running_query(labourer)?).await?)
    }

    /// Open leases older than duration + cooldown.
    pub async fn get_expired_tasks_for_labourer(&self, labourer: &Labourer) -> Result<Vec<Task>> {
        let query = self
            .greenfield_query(labourer)
            .range(Condition::between(
                fields::GREENFIELD,
                labourer.start()?,
                labourer.expired()?,
            ))
            .filter(Condition::not_exists(fields::CLOSED_AT));
        self.tasks(query).await
    }

    /// Leased tasks the executor has closed but that are still live.
    pub async fn get_closed_tasks_for_labourer(&self, labourer: &Labourer) -> Result<Vec<Task>> {
        let query = self
            .greenfield_query(labourer)
            .range(Condition::ge(fields::GREENFIELD, labourer.start()?))
            .filter(Condition::exists(fields::CLOSED_AT));
        self.tasks(query).await
    }

    /// Most recently archived completed tasks of a labourer.
    pub async fn get_completed_tasks_for_labourer(
        &self,
        labourer: &Labourer,
        limit: usize,
    ) -> Result<Vec<ClosedTask>> {
        let query = Query::new(
            &self.config.closed_table_name,
            status_key(&labourer.id, true),
        )
        .index(&self.config.closed_index)
        .descending()
        .limit(limit);

        let rows = self.store.query(&query).await?;
        Ok(self.parse_rows(&self.config.closed_table_name, rows, ClosedTask::from_row))
    }

    /// Run times of recently completed tasks, in seconds.
    async fn completed_durations(&self, labourer: &Labourer) -> Result<Vec<u64>> {
        let closed = self
            .get_completed_tasks_for_labourer(labourer, self.config.duration_sample_size)
            .await?;

        Ok(closed
            .iter()
            .filter_map(|closed| {
                let invoked_at = closed.task.greenfield - self.config.greenfield_invocation_delta;
                let completed_at = closed.task.completed_at?;
                u64::try_from(completed_at - invoked_at).ok()
            })
            .collect())
    }

    /// Mean run time of recent completed tasks, the configured duration when
    /// there are none.
    pub async fn get_average_labourer_duration(&self, labourer: &Labourer) -> Result<u64> {
        let durations = self.completed_durations(labourer).await?;
        if durations.is_empty() {
            return Ok(labourer.duration);
        }
        Ok(durations.iter().sum::<u64>() / durations.len() as u64)
    }

    /// Longest run time of recent completed tasks, the configured duration
    /// when there are none.
    pub async fn get_max_labourer_duration(&self, labourer: &Labourer) -> Result<u64> {
        let durations = self.completed_durations(labourer).await?;
        Ok(durations.into_iter().max().unwrap_or(labourer.duration))
    }

    async fn tasks(&self, query: Query) -> Result<Vec<Task>> {
        let rows = self.store.query(&query).await?;
        Ok(self.parse_rows(&query.table, rows, Task::from_row))
    }

    /// Parse rows one at a time. A row that does not parse is logged,
    /// counted and left out, so the rest of its partition is still served.
    fn parse_rows<T>(
        &self,
        table: &str,
        rows: Vec<Row>,
        parse: impl Fn(Row) -> overseer_core::Result<T>,
    ) -> Vec<T> {
        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id = row
                .get(fields::TASK_ID)
                .map_or_else(|| "<no id>".to_string(), |id| id.to_string());
            match parse(row) {
                Ok(item) => parsed.push(item),
                Err(e) => {
                    error!("Skipping unreadable row {} in {}: {}", task_id, table, e);
                    self.metrics.inc_unreadable_rows(table);
                }
            }
        }
        parsed
    }
}

#[async_trait]
impl CompletionCallback for TaskManager {
    async fn mark_task_completed(&self, labourer_id: &str, task_id: &str) -> CollaboratorResult<()> {
        debug!("Labourer {} completed task {}", labourer_id, task_id);
        self.close_task(task_id, true)
            .await
            .map(|_| ())
            .map_err(|e| CollaboratorError::Completion(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LabourerConfig;
    use overseer_core::{CollaboratorResult, ManualClock};
    use overseer_persistence::{BatchGet, MemoryStore, StoreError};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub const NOW: i64 = 1_700_000_000;
    pub const DELTA: i64 = 31_557_600;

    #[derive(Default)]
    pub struct RecordingInvoker {
        pub invocations: Mutex<Vec<Invocation>>,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(&self, _labourer: &Labourer, invocation: &Invocation) -> CollaboratorResult<()> {
            self.invocations.lock().push(invocation.clone());
            Ok(())
        }
    }

    pub struct FixedEcology(pub u8);

    #[async_trait]
    impl EcologySource for FixedEcology {
        async fn get_labourer_status(&self, _labourer: &Labourer) -> CollaboratorResult<u8> {
            Ok(self.0)
        }
    }

    pub struct Harness {
        pub manager: Arc<TaskManager>,
        pub store: Arc<MemoryStore>,
        pub invoker: Arc<RecordingInvoker>,
        pub clock: ManualClock,
    }

    impl Harness {
        pub async fn labourer(&self, id: &str) -> Labourer {
            self.manager
                .register_labourers(&FixedEcology(4))
                .await
                .unwrap()
                .into_iter()
                .find(|l| l.id == id)
                .unwrap()
        }

        pub fn live(&self) -> usize {
            self.store.len(&self.manager.config().table_name)
        }

        pub fn retry(&self) -> usize {
            self.store.len(&self.manager.config().retry_table_name)
        }

        pub fn closed(&self) -> usize {
            self.store.len(&self.manager.config().closed_table_name)
        }
    }

    pub fn config() -> TaskManagerConfig {
        let mut config = TaskManagerConfig::default();
        let mut labourer = LabourerConfig::new("lab");
        labourer.duration = Some(100);
        labourer.cooldown = Some(20);
        labourer.max_simultaneous_invocations = Some(4);
        config.labourers.push(labourer);
        config.labourers.push(LabourerConfig::new("other"));
        config.batch_get_backoff_ms = 1;
        config
    }

    pub fn harness() -> Harness {
        let config = config();
        let store = Arc::new(MemoryStore::new(config.schemas()));
        let invoker = Arc::new(RecordingInvoker::default());
        let clock = ManualClock::new(NOW);

        let manager = TaskManager::builder()
            .config(config)
            .store(store.clone())
            .invoker(invoker.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        Harness {
            manager: Arc::new(manager),
            store,
            invoker,
            clock,
        }
    }

    pub fn fields_of(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    pub async fn put_task(h: &Harness, id: &str, labourer: &str, greenfield: i64, attempts: u32) {
        let row = fields_of(json!({
            "task_id": id,
            "labourer_id": labourer,
            "created_at": NOW - 10_000,
            "greenfield": greenfield,
            "attempts": attempts,
        }));
        h.store.put(&h.manager.config().table_name, row).await.unwrap();
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.task_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_builder_requires_store_and_invoker() {
        let result = TaskManager::builder()
            .invoker(Arc::new(RecordingInvoker::default()))
            .build();
        assert!(matches!(result, Err(ManagerError::Config(_))));

        let result = TaskManager::builder()
            .store(Arc::new(MemoryStore::new(config().schemas())))
            .build();
        assert!(matches!(result, Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn test_register_labourers_sets_window_and_defaults() {
        let h = harness();
        let labourers = h.manager.register_labourers(&FixedEcology(3)).await.unwrap();
        assert_eq!(labourers.len(), 2);

        let lab = &labourers[0];
        assert_eq!(lab.start().unwrap(), NOW);
        assert_eq!(lab.invoked().unwrap(), NOW + DELTA);
        assert_eq!(lab.expired().unwrap(), NOW + DELTA - 120);
        assert_eq!(lab.health, Some(3));
        assert_eq!(lab.max_attempts, 3);
        // no history yet: estimates fall back to the configured duration
        assert_eq!(lab.average_duration, Some(100));
        assert_eq!(lab.max_duration, Some(100));

        let other = &labourers[1];
        assert_eq!(other.duration, 900);
        assert_eq!(other.cooldown, 300);
    }

    #[tokio::test]
    async fn test_oldest_greenfield_on_empty_queue_is_step() {
        let h = harness();
        let lab = h.labourer("lab").await;

        assert_eq!(h.manager.get_oldest_greenfield_for_labourer(&lab, false).await.unwrap(), 1000);
        assert_eq!(h.manager.get_newest_greenfield_for_labourer(&lab).await.unwrap(), 1000);
        assert_eq!(h.manager.get_length_of_queue_for_labourer(&lab).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_task_generates_required_fields() {
        let h = harness();
        let lab = h.labourer("lab").await;

        let first = h
            .manager
            .create_task(&lab, fields_of(json!({"payload": {"url": "x"}, "tags": ["a"]})))
            .await
            .unwrap();
        let second = h.manager.create_task(&lab, Row::new()).await.unwrap();

        let first = h.manager.get_task_by_id(&first).await.unwrap().unwrap();
        assert_eq!(first.labourer_id, "lab");
        assert_eq!(first.created_at, NOW);
        assert_eq!(first.greenfield, 2000);
        assert_eq!(first.attempts, 0);
        assert_eq!(first.payload.as_deref(), Some(r#"{"url":"x"}"#));
        assert_eq!(first.extra.get("tags"), Some(&json!(r#"["a"]"#)));

        let second = h.manager.get_task_by_id(&second).await.unwrap().unwrap();
        assert_eq!(second.greenfield, 3000);
        assert_ne!(first.task_id, second.task_id);

        assert_eq!(h.manager.get_length_of_queue_for_labourer(&lab).await.unwrap(), 2);
        assert_eq!(h.manager.metrics().tasks_total_value("created", "lab"), 2);
    }

    #[tokio::test]
    async fn test_create_task_without_generator_is_config_error() {
        let mut config = config();
        config.required_fields.push("owner".to_string());
        let manager = TaskManager::builder()
            .store(Arc::new(MemoryStore::new(config.schemas())))
            .invoker(Arc::new(RecordingInvoker::default()))
            .clock(Arc::new(ManualClock::new(NOW)))
            .config(config)
            .build()
            .unwrap();
        let lab = manager
            .register_labourers(&FixedEcology(4))
            .await
            .unwrap()
            .remove(0);

        let err = manager.create_task(&lab, Row::new()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));
        assert!(err.is_fatal());

        manager
            .create_task(&lab, fields_of(json!({"owner": "me"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_next_is_fifo_and_read_only() {
        let h = harness();
        put_task(&h, "c", "lab", 3000, 0).await;
        put_task(&h, "a", "lab", 1000, 0).await;
        put_task(&h, "b", "lab", 2000, 0).await;
        put_task(&h, "leased", "lab", NOW + DELTA - 50, 1).await;
        put_task(&h, "foreign", "other", 500, 0).await;
        let lab = h.labourer("lab").await;

        let next = h.manager.get_next_for_labourer(&lab, 2).await.unwrap();
        assert_eq!(ids(&next), vec!["a", "b"]);

        let all = h.manager.get_next_for_labourer(&lab, 10).await.unwrap();
        assert_eq!(ids(&all), vec!["a", "b", "c"]);

        assert!(h.manager.get_next_for_labourer(&lab, 0).await.unwrap().is_empty());
        let again = h.manager.get_next_for_labourer(&lab, 10).await.unwrap();
        assert_eq!(all, again);
    }

    #[tokio::test]
    async fn test_mark_task_invoked_leases_once() {
        let h = harness();
        put_task(&h, "t1", "lab", 1000, 0).await;
        let lab = h.labourer("lab").await;
        let task = h.manager.get_task_by_id("t1").await.unwrap().unwrap();

        let (first, second) = tokio::join!(
            h.manager.mark_task_invoked(&lab, &task, true),
            h.manager.mark_task_invoked(&lab, &task, true),
        );
        let outcomes = [first.unwrap(), second.unwrap()];
        let acquired = outcomes
            .iter()
            .filter(|o| matches!(o, LeaseOutcome::Acquired(_)))
            .count();
        assert_eq!(acquired, 1);
        assert!(outcomes.contains(&LeaseOutcome::AlreadyLeased));

        let stored = h.manager.get_task_by_id("t1").await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.greenfield, NOW + DELTA);
    }

    #[tokio::test]
    async fn test_concurrent_managers_lease_once() {
        let h = harness();
        put_task(&h, "t1", "lab", 1000, 0).await;
        let lab = h.labourer("lab").await;
        let task = h.manager.get_task_by_id("t1").await.unwrap().unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = h.manager.clone();
            let lab = lab.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                manager.mark_task_invoked(&lab, &task, true).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), LeaseOutcome::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(
            h.manager.get_task_by_id("t1").await.unwrap().unwrap().attempts,
            1
        );
    }

    #[tokio::test]
    async fn test_mark_task_invoked_rejects_foreign_task() {
        let h = harness();
        put_task(&h, "t1", "other", 1000, 0).await;
        let lab = h.labourer("lab").await;
        let task = h.manager.get_task_by_id("t1").await.unwrap().unwrap();

        let err = h.manager.mark_task_invoked(&lab, &task, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::LabourerMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_mark_task_invoked_without_running_check() {
        let h = harness();
        put_task(&h, "t1", "lab", NOW + 5, 1).await;
        let lab = h.labourer("lab").await;
        let task = h.manager.get_task_by_id("t1").await.unwrap().unwrap();

        assert_eq!(
            h.manager.mark_task_invoked(&lab, &task, true).await.unwrap(),
            LeaseOutcome::AlreadyLeased
        );
        assert!(matches!(
            h.manager.mark_task_invoked(&lab, &task, false).await.unwrap(),
            LeaseOutcome::Acquired(_)
        ));

        h.store
            .delete(&h.manager.config().table_name, &json!("t1"))
            .await
            .unwrap();
        assert_eq!(
            h.manager.mark_task_invoked(&lab, &task, false).await.unwrap(),
            LeaseOutcome::AlreadyLeased
        );
        assert_eq!(h.live(), 0);
    }

    #[tokio::test]
    async fn test_invoke_task_invokes_and_skips() {
        let h = harness();
        h.store
            .put(
                &h.manager.config().table_name,
                fields_of(json!({
                    "task_id": "t1",
                    "labourer_id": "lab",
                    "created_at": NOW,
                    "greenfield": 1000,
                    "payload": r#"{"n":1}"#,
                })),
            )
            .await
            .unwrap();
        let lab = h.labourer("lab").await;
        let stale = h.manager.get_task_by_id("t1").await.unwrap().unwrap();

        let outcome = h
            .manager
            .invoke_task(&lab, InvokeTarget::Id("t1".to_string()))
            .await
            .unwrap();
        assert!(matches!(outcome, InvokeOutcome::Invoked(ref t) if t.attempts == 1));

        let invocations = h.invoker.invocations.lock().clone();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].payload, json!({"n": 1}));
        assert_eq!(invocations[0].attempt, 1);

        // A second orchestrator still holding the old read loses the race.
        let outcome = h.manager.invoke_task(&lab, stale.into()).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Skipped);
        assert_eq!(h.manager.metrics().concurrent_task_invocations_skipped.get(), 1);
        assert_eq!(h.invoker.invocations.lock().len(), 1);

        let missing = h
            .manager
            .invoke_task(&lab, InvokeTarget::Id("ghost".to_string()))
            .await;
        assert!(matches!(missing, Err(ManagerError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_window_queries_partition_leases() {
        let h = harness();
        // duration + cooldown = 120
        put_task(&h, "queued", "lab", 1000, 0).await;
        put_task(&h, "fresh", "lab", NOW + DELTA, 1).await;
        put_task(&h, "running", "lab", NOW + DELTA - 60, 1).await;
        put_task(&h, "expired", "lab", NOW + DELTA - 500, 1).await;
        put_task(&h, "closed", "lab", NOW + DELTA - 500, 1).await;
        h.manager.close_task("closed", true).await.unwrap();
        let lab = h.labourer("lab").await;

        let invoked = h.manager.get_invoked_tasks_for_labourer(&lab, None).await.unwrap();
        assert_eq!(ids(&invoked), vec!["fresh"]);
        let invoked_open = h
            .manager
            .get_invoked_tasks_for_labourer(&lab, Some(false))
            .await
            .unwrap();
        assert_eq!(ids(&invoked_open), vec!["fresh"]);
        assert!(h
            .manager
            .get_invoked_tasks_for_labourer(&lab, Some(true))
            .await
            .unwrap()
            .is_empty());

        let running = h.manager.get_running_tasks_for_labourer(&lab).await.unwrap();
        assert_eq!(ids(&running), vec!["running", "fresh"]);
        assert_eq!(
            h.manager.get_count_of_running_tasks_for_labourer(&lab).await.unwrap(),
            2
        );

        let expired = h.manager.get_expired_tasks_for_labourer(&lab).await.unwrap();
        assert_eq!(ids(&expired), vec!["expired"]);

        let closed = h.manager.get_closed_tasks_for_labourer(&lab).await.unwrap();
        assert_eq!(ids(&closed), vec!["closed"]);

        // queue length only sees what is not leased
        assert_eq!(h.manager.get_length_of_queue_for_labourer(&lab).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_row_is_skipped_by_window_queries() {
        let h = harness();
        put_task(&h, "a", "lab", 1000, 0).await;
        put_task(&h, "b", "lab", 3000, 0).await;
        put_task(&h, "expired", "lab", NOW + DELTA - 500, 1).await;
        for (id, greenfield) in [("bad-queued", 2000), ("bad-expired", NOW + DELTA - 400)] {
            let row = fields_of(json!({
                "task_id": id,
                "labourer_id": "lab",
                "created_at": NOW,
                "greenfield": greenfield,
                "attempts": "many",
            }));
            h.store.put(&h.manager.config().table_name, row).await.unwrap();
        }
        let lab = h.labourer("lab").await;

        let next = h.manager.get_next_for_labourer(&lab, 10).await.unwrap();
        assert_eq!(ids(&next), vec!["a", "b"]);
        let expired = h.manager.get_expired_tasks_for_labourer(&lab).await.unwrap();
        assert_eq!(ids(&expired), vec!["expired"]);
        assert_eq!(
            h.manager
                .metrics()
                .unreadable_rows_total
                .with_label_values(&["tasks"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_task_state_follows_lease() {
        let h = harness();
        put_task(&h, "t1", "lab", 1000, 0).await;
        put_task(&h, "stale", "lab", NOW + DELTA - 500, 1).await;
        let lab = h.labourer("lab").await;

        let (_, state) = h.manager.get_task_state(&lab, "t1").await.unwrap().unwrap();
        assert_eq!(state, WindowState::Queued);
        let (_, state) = h.manager.get_task_state(&lab, "stale").await.unwrap().unwrap();
        assert_eq!(state, WindowState::Expired);

        h.manager.invoke_task(&lab, InvokeTarget::Id("t1".to_string())).await.unwrap();
        let (task, state) = h.manager.get_task_state(&lab, "t1").await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(state, WindowState::Invoked);

        // a later cycle sees the same lease as running
        h.clock.advance(30);
        let lab = h.labourer("lab").await;
        let (_, state) = h.manager.get_task_state(&lab, "t1").await.unwrap().unwrap();
        assert_eq!(state, WindowState::Running);

        assert!(h.manager.get_task_state(&lab, "ghost").await.unwrap().is_none());
        let other = h.labourer("other").await;
        assert!(matches!(
            h.manager.get_task_state(&other, "t1").await,
            Err(ManagerError::LabourerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_task_of_missing_task() {
        let h = harness();
        assert!(!h.manager.close_task("ghost", true).await.unwrap());
        assert_eq!(h.live(), 0);
    }

    #[tokio::test]
    async fn test_archive_task_status_keys() {
        let h = harness();
        put_task(&h, "done", "lab", NOW + DELTA - 10, 1).await;
        put_task(&h, "failed", "lab", NOW + DELTA - 10, 3).await;
        h.manager.close_task("done", true).await.unwrap();
        h.clock.advance(5);

        h.manager.archive_task("done").await.unwrap();
        h.manager.archive_task("failed").await.unwrap();

        assert_eq!(h.live(), 0);
        assert_eq!(h.closed(), 2);

        let closed_table = &h.manager.config().closed_table_name;
        let done = ClosedTask::from_row(h.store.get(closed_table, &json!("done")).await.unwrap().unwrap()).unwrap();
        assert_eq!(done.labourer_id_task_status, "lab_1");
        assert_eq!(done.task.closed_at, Some(NOW + 5));

        let failed = ClosedTask::from_row(h.store.get(closed_table, &json!("failed")).await.unwrap().unwrap()).unwrap();
        assert_eq!(failed.labourer_id_task_status, "lab_0");
        assert!(failed.task.closed_at.is_some());

        assert!(matches!(
            h.manager.archive_task("done").await,
            Err(ManagerError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_tasks_give_duration_estimates() {
        let h = harness();
        // invoked 30s and 90s before completion
        put_task(&h, "t1", "lab", NOW - 30 + DELTA, 1).await;
        put_task(&h, "t2", "lab", NOW - 90 + DELTA, 1).await;
        h.manager.close_task("t1", true).await.unwrap();
        h.manager.close_task("t2", true).await.unwrap();
        h.manager.archive_task("t1").await.unwrap();
        h.manager.archive_task("t2").await.unwrap();

        let lab = h.labourer("lab").await;
        assert_eq!(h.manager.get_completed_tasks_for_labourer(&lab, 10).await.unwrap().len(), 2);
        assert_eq!(h.manager.get_average_labourer_duration(&lab).await.unwrap(), 60);
        assert_eq!(h.manager.get_max_labourer_duration(&lab).await.unwrap(), 90);
        assert_eq!(lab.max_duration, Some(90));
    }

    #[tokio::test]
    async fn test_move_to_retry_and_back_to_front() {
        let h = harness();
        put_task(&h, "queued", "lab", 5000, 0).await;
        put_task(&h, "a", "lab", NOW + DELTA - 500, 1).await;
        put_task(&h, "b", "lab", NOW + DELTA - 400, 2).await;
        let lab = h.labourer("lab").await;

        let a = h.manager.get_task_by_id("a").await.unwrap().unwrap();
        let b = h.manager.get_task_by_id("b").await.unwrap().unwrap();
        h.manager.move_task_to_retry_table(&a, 0).await.unwrap();
        h.manager.move_task_to_retry_table(&b, 60).await.unwrap();
        assert_eq!(h.live(), 1);
        assert_eq!(h.retry(), 2);

        // only "a" is due
        let due = h.manager.get_tasks_to_retry_for_labourer(&lab, None).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].desired_launch_time, NOW);

        h.clock.advance(60);
        let due = h.manager.get_tasks_to_retry_for_labourer(&lab, None).await.unwrap();
        assert_eq!(
            due.iter().map(|r| r.task.task_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        assert_eq!(h.manager.retry_tasks(&lab, due).await.unwrap(), 2);
        assert_eq!(h.retry(), 0);

        let a = h.manager.get_task_by_id("a").await.unwrap().unwrap();
        let b = h.manager.get_task_by_id("b").await.unwrap().unwrap();
        assert_eq!(b.greenfield, 4999);
        assert_eq!(a.greenfield, 4998);
        assert_eq!(a.attempts, 1);
        assert!(!a.extra.contains_key("desired_launch_time"));

        let next = h.manager.get_next_for_labourer(&lab, 10).await.unwrap();
        assert_eq!(ids(&next), vec!["a", "b", "queued"]);
    }

    #[tokio::test]
    async fn test_retry_tasks_batches_transactions() {
        let h = harness();
        let lab = h.labourer("lab").await;

        let mut retries = Vec::new();
        for i in 0..12 {
            let task = Task::from_row(fields_of(json!({
                "task_id": format!("t{:02}", i),
                "labourer_id": "lab",
                "created_at": NOW,
                "greenfield": NOW + DELTA - 1000,
                "attempts": 1,
            })))
            .unwrap();
            let retry = RetryTask::new(task, NOW);
            h.store
                .put(&h.manager.config().retry_table_name, retry.to_row().unwrap())
                .await
                .unwrap();
            retries.push(retry);
        }

        // 12 tasks need 24 writes, more than one transaction holds
        assert_eq!(h.manager.retry_tasks(&lab, retries).await.unwrap(), 12);
        assert_eq!(h.retry(), 0);
        assert_eq!(h.live(), 12);

        let next = h.manager.get_next_for_labourer(&lab, 20).await.unwrap();
        let expected: Vec<String> = (0..12).map(|i| format!("t{:02}", i)).collect();
        assert_eq!(ids(&next), expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(next[0].greenfield, 1000 - 12);
        assert_eq!(next[11].greenfield, 999);
    }

    /// Delegates to a memory store but holds back keys on the first batch
    /// get and refuses transactions.
    struct FlakyStore {
        inner: MemoryStore,
        withheld: AtomicBool,
    }

    #[async_trait]
    impl IndexedStore for FlakyStore {
        async fn get(&self, table: &str, key: &Value) -> overseer_persistence::Result<Option<Row>> {
            self.inner.get(table, key).await
        }

        async fn batch_get(&self, table: &str, keys: &[Value]) -> overseer_persistence::Result<BatchGet> {
            if keys.len() > 1 && !self.withheld.swap(true, Ordering::SeqCst) {
                let mut response = self.inner.batch_get(table, &keys[..1]).await?;
                response.unprocessed = keys[1..].to_vec();
                return Ok(response);
            }
            self.inner.batch_get(table, keys).await
        }

        async fn put(&self, table: &str, row: Row) -> overseer_persistence::Result<()> {
            self.inner.put(table, row).await
        }

        async fn query(&self, query: &Query) -> overseer_persistence::Result<Vec<Row>> {
            self.inner.query(query).await
        }

        async fn count(&self, query: &Query) -> overseer_persistence::Result<usize> {
            self.inner.count(query).await
        }

        async fn update(&self, update: &Update) -> overseer_persistence::Result<UpdateOutcome> {
            self.inner.update(update).await
        }

        async fn delete(&self, table: &str, key: &Value) -> overseer_persistence::Result<()> {
            self.inner.delete(table, key).await
        }

        async fn transact_write(&self, _ops: Vec<WriteOp>) -> overseer_persistence::Result<()> {
            Err(StoreError::TransactionsUnsupported)
        }

        fn supports_transactions(&self) -> bool {
            false
        }
    }

    fn flaky_manager() -> (TaskManager, Arc<FlakyStore>) {
        let config = config();
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(config.schemas()),
            withheld: AtomicBool::new(false),
        });
        let manager = TaskManager::builder()
            .config(config)
            .store(store.clone())
            .invoker(Arc::new(RecordingInvoker::default()))
            .clock(Arc::new(ManualClock::new(NOW)))
            .build()
            .unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_get_tasks_by_ids_retries_unprocessed_keys() {
        let (manager, _store) = flaky_manager();
        let lab = manager
            .register_labourers(&FixedEcology(4))
            .await
            .unwrap()
            .remove(0);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(manager.create_task(&lab, Row::new()).await.unwrap());
        }
        ids.push("missing".to_string());

        let mut tasks = manager.get_tasks_by_ids(&ids).await.unwrap();
        tasks.sort_by_key(|t| t.greenfield);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].task_id, ids[0]);
    }

    #[tokio::test]
    async fn test_moves_without_transactions_fall_back_to_two_writes() {
        let (manager, store) = flaky_manager();
        let lab = manager
            .register_labourers(&FixedEcology(4))
            .await
            .unwrap()
            .remove(0);
        let id = manager.create_task(&lab, Row::new()).await.unwrap();
        let task = manager.get_task_by_id(&id).await.unwrap().unwrap();

        manager.move_task_to_retry_table(&task, 0).await.unwrap();
        assert!(store.inner.is_empty("tasks"));

        let due = manager.get_tasks_to_retry_for_labourer(&lab, Some(5)).await.unwrap();
        assert_eq!(manager.retry_tasks(&lab, due).await.unwrap(), 1);
        assert!(store.inner.is_empty("retry_tasks"));

        manager.archive_task(&id).await.unwrap();
        assert_eq!(store.inner.len("closed_tasks"), 1);
        assert!(store.inner.is_empty("tasks"));
    }
}
