mod clock;
mod collaborators;
mod error;
mod labourer;
mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    CollaboratorResult, CompletionCallback, EcologySource, Invocation, Invoker, Notifier,
};
pub use error::{CollaboratorError, CoreError, Result};
pub use labourer::{
    Labourer, LabourerAttributes, TimestampName, WindowState, DEFAULT_COOLDOWN, DEFAULT_DURATION,
    DEFAULT_MAX_ATTEMPTS,
};
pub use task::{fields, status_key, ClosedTask, RetryTask, Row, Task, TaskId};

/// Roughly one year in seconds, added to a greenfield when its task is leased.
pub const DEFAULT_GREENFIELD_INVOCATION_DELTA: i64 = 31_557_600;

/// Spacing between consecutive greenfields in a queue.
pub const DEFAULT_GREENFIELD_TASK_STEP: i64 = 1000;
