use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for the control plane
pub struct ControlMetrics {
    pub registry: Registry,

    // Task lifecycle events by labourer
    pub tasks_total: IntCounterVec,

    // Lease races lost to another invoker
    pub concurrent_task_invocations_skipped: IntCounter,

    // Per-task failures swallowed during a sweep or orchestration cycle
    pub cycle_errors_total: IntCounterVec,

    // Stored rows that could not be read back as tasks
    pub unreadable_rows_total: IntCounterVec,

    // Queue state per labourer, refreshed by each orchestration cycle
    pub queue_length: IntGaugeVec,
    pub running_tasks: IntGaugeVec,

    pub cycle_duration: HistogramVec,
}

impl ControlMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("ov_tasks_total", "Task lifecycle events by labourer"),
            &["event", "labourer"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let concurrent_task_invocations_skipped = IntCounter::new(
            "ov_concurrent_task_invocations_skipped",
            "Invocations skipped because another invoker leased the task first",
        )?;
        registry.register(Box::new(concurrent_task_invocations_skipped.clone()))?;

        let cycle_errors_total = IntCounterVec::new(
            Opts::new("ov_cycle_errors_total", "Errors isolated during a cycle"),
            &["component"],
        )?;
        registry.register(Box::new(cycle_errors_total.clone()))?;

        let unreadable_rows_total = IntCounterVec::new(
            Opts::new("ov_unreadable_rows_total", "Rows skipped because they did not parse"),
            &["table"],
        )?;
        registry.register(Box::new(unreadable_rows_total.clone()))?;

        let queue_length = IntGaugeVec::new(
            Opts::new("ov_queue_length", "Queued tasks per labourer"),
            &["labourer"],
        )?;
        registry.register(Box::new(queue_length.clone()))?;

        let running_tasks = IntGaugeVec::new(
            Opts::new("ov_running_tasks", "Leased tasks inside their lease window"),
            &["labourer"],
        )?;
        registry.register(Box::new(running_tasks.clone()))?;

        let cycle_duration = HistogramVec::new(
            HistogramOpts::new("ov_cycle_duration_seconds", "Duration of one cycle"),
            &["component"],
        )?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(ControlMetrics {
            registry,
            tasks_total,
            concurrent_task_invocations_skipped,
            cycle_errors_total,
            unreadable_rows_total,
            queue_length,
            running_tasks,
            cycle_duration,
        })
    }

    /// Increment task event counter
    pub fn inc_tasks_total(&self, event: &str, labourer: &str) {
        self.tasks_total.with_label_values(&[event, labourer]).inc();
    }

    pub fn tasks_total_value(&self, event: &str, labourer: &str) -> u64 {
        self.tasks_total.with_label_values(&[event, labourer]).get()
    }

    pub fn inc_cycle_errors(&self, component: &str) {
        self.cycle_errors_total.with_label_values(&[component]).inc();
    }

    pub fn inc_unreadable_rows(&self, table: &str) {
        self.unreadable_rows_total.with_label_values(&[table]).inc();
    }

    pub fn observe_cycle_duration(&self, component: &str, duration_secs: f64) {
        self.cycle_duration
            .with_label_values(&[component])
            .observe(duration_secs);
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
