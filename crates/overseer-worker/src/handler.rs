use async_trait::async_trait;
use overseer_core::Invocation;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for task handlers
pub type TaskResult = Result<Value, String>;

/// Code that runs one invocation of a labourer
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task described by the invocation
    async fn execute(&self, invocation: &Invocation) -> TaskResult;
}

/// Registry of task handlers by labourer id
pub struct TaskHandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        TaskHandlerRegistry {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register the handler that executes tasks of a labourer
    pub fn register<H: TaskHandler + 'static>(&self, labourer_id: &str, handler: H) {
        let mut handlers = self.handlers.write();
        handlers.insert(labourer_id.to_string(), Arc::new(handler));
    }

    pub fn get(&self, labourer_id: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read();
        handlers.get(labourer_id).cloned()
    }

    pub fn has_handler(&self, labourer_id: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(labourer_id)
    }

    /// Get all labourer ids with a handler
    pub fn labourer_ids(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        handlers.keys().cloned().collect()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, invocation: &Invocation) -> TaskResult {
        Ok(invocation.payload.clone())
    }
}

/// Handler that simulates work by sleeping
pub struct SleepHandler {
    duration_ms: u64,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler { duration_ms }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn execute(&self, invocation: &Invocation) -> TaskResult {
        tokio::time::sleep(tokio::time::Duration::from_millis(self.duration_ms)).await;
        Ok(invocation.payload.clone())
    }
}
