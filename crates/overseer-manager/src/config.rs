//! Typed configuration of the control plane.
//!
//! Values are layered with the `config` crate, lowest precedence first:
//! built-in defaults, an optional YAML/TOML file, `OVERSEER__*` environment
//! variables (`__` separates nesting levels), then caller overrides such as
//! CLI flags. The merged result is validated before anything uses it.

use crate::error::{ManagerError, Result};
use config::{Config, Environment, File};
use overseer_core::{
    fields, Labourer, LabourerAttributes, DEFAULT_GREENFIELD_INVOCATION_DELTA, DEFAULT_GREENFIELD_TASK_STEP,
    DEFAULT_MAX_ATTEMPTS,
};
use overseer_persistence::TableSchema;
use overseer_worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub task_manager: TaskManagerConfig,
    pub scavenger: ScavengerConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
    pub invoker: InvokerConfig,
    pub worker: WorkerConfig,
    pub ecology: EcologyConfig,
    pub notifier: NotifierConfig,
    pub monitoring: MonitoringConfig,
}

/// Statically configured labourer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabourerConfig {
    pub id: String,
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub cooldown: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_simultaneous_invocations: Option<u32>,
}

impl LabourerConfig {
    pub fn new(id: &str) -> Self {
        LabourerConfig {
            id: id.to_string(),
            ..LabourerConfig::default()
        }
    }

    pub fn attributes(&self) -> LabourerAttributes {
        LabourerAttributes {
            arn: self.arn.clone(),
            duration: self.duration,
            cooldown: self.cooldown,
            max_attempts: self.max_attempts,
            max_simultaneous_invocations: self.max_simultaneous_invocations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    pub table_name: String,
    /// Live table index on `(labourer_id, greenfield)`.
    pub greenfield_index: String,
    pub retry_table_name: String,
    /// Retry table index on `(labourer_id, desired_launch_time)`.
    pub retry_index: String,
    pub closed_table_name: String,
    /// Closed table index on `(labourer_id_task_status, closed_at)`.
    pub closed_index: String,
    pub greenfield_invocation_delta: i64,
    pub greenfield_task_step: i64,
    /// Used for labourers that do not set `max_attempts` themselves.
    pub default_max_attempts: u32,
    /// Columns every new task must carry, generated when possible.
    pub required_fields: Vec<String>,
    pub batch_get_max_retries: u32,
    pub batch_get_backoff_ms: u64,
    /// Closed tasks sampled when estimating labourer durations.
    pub duration_sample_size: usize,
    pub labourers: Vec<LabourerConfig>,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        TaskManagerConfig {
            table_name: "tasks".to_string(),
            greenfield_index: "labourer_id_greenfield".to_string(),
            retry_table_name: "retry_tasks".to_string(),
            retry_index: "labourer_id_desired_launch_time".to_string(),
            closed_table_name: "closed_tasks".to_string(),
            closed_index: "labourer_id_task_status_closed_at".to_string(),
            greenfield_invocation_delta: DEFAULT_GREENFIELD_INVOCATION_DELTA,
            greenfield_task_step: DEFAULT_GREENFIELD_TASK_STEP,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            required_fields: vec![
                fields::TASK_ID.to_string(),
                fields::LABOURER_ID.to_string(),
                fields::CREATED_AT.to_string(),
                fields::GREENFIELD.to_string(),
            ],
            batch_get_max_retries: 3,
            batch_get_backoff_ms: 100,
            duration_sample_size: 50,
            labourers: Vec::new(),
        }
    }
}

impl TaskManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.greenfield_task_step <= 0 {
            return Err(ManagerError::Config(
                "greenfield_task_step must be positive".to_string(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for labourer in &self.labourers {
            if labourer.id.trim().is_empty() {
                return Err(ManagerError::Config("labourer id must not be empty".to_string()));
            }
            if !ids.insert(labourer.id.as_str()) {
                return Err(ManagerError::Config(format!(
                    "labourer {} is configured twice",
                    labourer.id
                )));
            }

            let probe = Labourer::new(labourer.id.clone(), labourer.attributes())
                .map_err(|e| ManagerError::Config(format!("labourer {}: {}", labourer.id, e)))?;
            let lease_window = probe.lease_window();
            if self.greenfield_invocation_delta <= lease_window as i64 {
                return Err(ManagerError::Config(format!(
                    "greenfield_invocation_delta {} must exceed duration + cooldown ({}) of labourer {}",
                    self.greenfield_invocation_delta, lease_window, labourer.id
                )));
            }
        }

        for name in [
            &self.table_name,
            &self.retry_table_name,
            &self.closed_table_name,
        ] {
            if name.is_empty() {
                return Err(ManagerError::Config("table names must not be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Schemas of the live, retry and closed tables.
    pub fn schemas(&self) -> Vec<TableSchema> {
        vec![
            TableSchema::new(&self.table_name, fields::TASK_ID).with_index(
                &self.greenfield_index,
                fields::LABOURER_ID,
                fields::GREENFIELD,
            ),
            TableSchema::new(&self.retry_table_name, fields::TASK_ID).with_index(
                &self.retry_index,
                fields::LABOURER_ID,
                fields::DESIRED_LAUNCH_TIME,
            ),
            TableSchema::new(&self.closed_table_name, fields::TASK_ID).with_index(
                &self.closed_index,
                fields::LABOURER_ID_TASK_STATUS,
                fields::CLOSED_AT,
            ),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengerConfig {
    pub interval_secs: u64,
    /// Retry rows moved back to the live queue per labourer and sweep.
    pub retry_batch_limit: usize,
    /// Archive leased tasks that were closed by their executor.
    pub archive_closed_tasks: bool,
    pub notify_on_archive: bool,
}

impl Default for ScavengerConfig {
    fn default() -> Self {
        ScavengerConfig {
            interval_secs: 60,
            retry_batch_limit: 20,
            archive_closed_tasks: true,
            notify_on_archive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub interval_secs: u64,
    pub max_invocations_per_cycle: u32,
    /// Used for labourers without `max_simultaneous_invocations`.
    pub default_max_simultaneous_invocations: u32,
    /// Share of the simultaneous invocations allowed per health score,
    /// indexed by health (0 is dead, 4 is healthy).
    pub health_coefficients: Vec<f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            interval_secs: 60,
            max_invocations_per_cycle: 50,
            default_max_simultaneous_invocations: 2,
            health_coefficients: vec![0.0, 0.0, 0.25, 0.5, 1.0],
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.health_coefficients.is_empty() {
            return Err(ManagerError::Config(
                "health_coefficients must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .health_coefficients
            .iter()
            .find(|c| !(0.0..=1.0).contains(*c))
        {
            return Err(ManagerError::Config(format!(
                "health coefficient {} is outside 0..=1",
                bad
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Rocksdb,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokerKind {
    /// Run tasks on the in-process worker runtime.
    Local,
    /// POST invocations to each labourer's `arn`.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    pub kind: InvokerKind,
    pub timeout_ms: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        InvokerConfig {
            kind: InvokerKind::Local,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EcologyConfig {
    pub default_health: u8,
    /// Health per labourer id.
    pub health: HashMap<String, u8>,
}

impl Default for EcologyConfig {
    fn default() -> Self {
        EcologyConfig {
            default_health: 4,
            health: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Post notifications here instead of only logging them.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
        }
    }
}

impl ControlConfig {
    /// Load configuration from an optional file, the environment and
    /// `overrides` (dotted keys such as `scavenger.interval_secs`).
    pub fn load(path: Option<&Path>, overrides: &[(String, String)]) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("OVERSEER")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key.as_str(), value.as_str())?;
        }

        let config: ControlConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.task_manager.validate()?;
        self.orchestrator.validate()?;

        if self.invoker.kind == InvokerKind::Http {
            if let Some(labourer) = self.task_manager.labourers.iter().find(|l| l.arn.is_none()) {
                return Err(ManagerError::Config(format!(
                    "labourer {} needs an arn for the http invoker",
                    labourer.id
                )));
            }
        }

        Ok(())
    }
}
