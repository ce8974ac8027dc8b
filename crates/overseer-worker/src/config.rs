use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    /// Invocations executed at the same time.
    pub concurrency: usize,
    /// Invocations buffered before `LocalInvoker::invoke` rejects new ones.
    pub queue_capacity: usize,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            concurrency: 4,
            queue_capacity: 256,
            graceful_shutdown_timeout_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}-{}", std::process::id(), &random[..8])
    }
}
