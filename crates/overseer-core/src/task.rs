use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a task
pub type TaskId = String;

/// A row as the indexed store sees it.
pub type Row = Map<String, Value>;

/// Column names shared by the live, retry and closed tables.
pub mod fields {
    pub const TASK_ID: &str = "task_id";
    pub const LABOURER_ID: &str = "labourer_id";
    pub const CREATED_AT: &str = "created_at";
    pub const GREENFIELD: &str = "greenfield";
    pub const ATTEMPTS: &str = "attempts";
    pub const PAYLOAD: &str = "payload";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const CLOSED_AT: &str = "closed_at";
    pub const DESIRED_LAUNCH_TIME: &str = "desired_launch_time";
    pub const LABOURER_ID_TASK_STATUS: &str = "labourer_id_task_status";
}

/// A task in the live queue.
///
/// `greenfield` carries both the queue position and the lease state. Any
/// column the caller adds beyond the known ones is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub labourer_id: String,
    pub created_at: i64,
    pub greenfield: i64,
    #[serde(default)]
    pub attempts: u32,
    /// JSON-serialized payload handed to the labourer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row))
            .map_err(|e| CoreError::InvalidTask(e.to_string()))
    }

    pub fn to_row(&self) -> Result<Row> {
        into_row(self)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Decode the stored payload, `Null` when there is none.
    pub fn payload_value(&self) -> Result<Value> {
        match &self.payload {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Value::Null),
        }
    }
}

/// A task parked in the retry table until `desired_launch_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    #[serde(flatten)]
    pub task: Task,
    pub desired_launch_time: i64,
}

impl RetryTask {
    pub fn new(task: Task, desired_launch_time: i64) -> Self {
        RetryTask {
            task,
            desired_launch_time,
        }
    }

    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row))
            .map_err(|e| CoreError::InvalidTask(e.to_string()))
    }

    pub fn to_row(&self) -> Result<Row> {
        into_row(self)
    }

    /// Drop the retry bookkeeping and get the plain task back.
    pub fn into_task(self) -> Task {
        self.task
    }
}

/// Terminal copy of a task, used for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTask {
    #[serde(flatten)]
    pub task: Task,
    pub labourer_id_task_status: String,
}

impl ClosedTask {
    /// Stamp `closed_at` and derive the `{labourer_id}_{0|1}` status key.
    pub fn close(mut task: Task, closed_at: i64) -> Self {
        task.closed_at = Some(closed_at);
        let labourer_id_task_status = status_key(&task.labourer_id, task.is_completed());
        ClosedTask {
            task,
            labourer_id_task_status,
        }
    }

    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row))
            .map_err(|e| CoreError::InvalidTask(e.to_string()))
    }

    pub fn to_row(&self) -> Result<Row> {
        into_row(self)
    }
}

/// Composite reporting key of the closed table.
pub fn status_key(labourer_id: &str, completed: bool) -> String {
    format!("{}_{}", labourer_id, u8::from(completed))
}

fn into_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(CoreError::InvalidTask(format!(
            "expected an object, got {}",
            other
        ))),
    }
}
