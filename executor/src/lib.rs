//! Runtime de ejecución de tareas: pool de workers, monitor por tarea con
//! reportes al coordinador y un plano de control HTTP embebido.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod factory;
pub mod logs;
pub mod monitor;
pub mod reporter;
pub mod result;
pub mod router;
pub mod server;
pub mod storage;
pub mod task;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use config::ExecutorConfig;
pub use context::JobContext;
pub use error::{ExecutorError, Result};
pub use executor::{Executor, RunningTask};
pub use factory::TaskFactory;
pub use task::Task;
