pub mod collaborators;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod scavenger;
pub mod task_manager;

pub use collaborators::{HttpInvoker, LogNotifier, StaticEcology, WebhookNotifier};
pub use config::{ControlConfig, LabourerConfig, TaskManagerConfig};
pub use error::{ManagerError, Result};
pub use metrics::ControlMetrics;
pub use orchestrator::{OrchestrationReport, Orchestrator};
pub use scavenger::{ExpiredAction, Scavenger, SweepReport};
pub use task_manager::{InvokeOutcome, InvokeTarget, LeaseOutcome, TaskManager, TaskManagerBuilder};
