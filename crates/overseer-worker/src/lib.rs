pub mod config;
pub mod executor;
pub mod handler;
pub mod invoker;
pub mod worker;

pub use config::WorkerConfig;
pub use executor::TaskExecutor;
pub use handler::{EchoHandler, SleepHandler, TaskHandler, TaskHandlerRegistry, TaskResult};
pub use invoker::{Dispatch, LocalInvoker};
pub use worker::WorkerRuntime;
