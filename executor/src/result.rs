use std::{collections::HashMap, sync::Arc};

use common::{HeartRequest, JobIdentity, TaskResult, TaskStatus};
use parking_lot::Mutex;
use serde_json::Value;

use crate::context::JobContext;
use crate::task::Task;

/// Tarea más lo que el executor sabe de ella: su contexto y un fallo
/// registrado desde fuera (pánico, arranque imposible, etc).
pub struct TaskContainer {
    task: Arc<dyn Task>,
    context: JobContext,
    failure: Mutex<Option<String>>,
}

impl TaskContainer {
    pub fn new(task: Arc<dyn Task>, context: JobContext) -> Self {
        Self {
            task,
            context,
            failure: Mutex::new(None),
        }
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn identity(&self) -> JobIdentity {
        self.context.identity()
    }

    /// Guarda el primer fallo; los siguientes se ignoran.
    pub fn record_failure(&self, message: impl Into<String>) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message.into());
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Estado observado. Un fallo registrado gana sobre un estado no
    /// terminal de la tarea; un estado terminal de la tarea no se pisa.
    pub fn status(&self) -> TaskStatus {
        let status = self.task.status();
        if !status.is_terminal() && self.failure.lock().is_some() {
            return TaskStatus::Failed;
        }
        status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Foto del estado actual lista para mandar al coordinador.
pub fn build_task_result(
    container: &TaskContainer,
    executor_endpoint: &str,
    log_metadata: Option<HashMap<String, String>>,
) -> TaskResult {
    let status = container.status();
    let progress = if status == TaskStatus::Done {
        100.0
    } else {
        clamp_progress(container.task().progress())
    };
    let result = if status.is_terminal() || status == TaskStatus::Running {
        container.task().task_result()
    } else {
        Value::Null
    };

    TaskResult {
        job_identity: container.identity(),
        status,
        progress,
        result,
        log_metadata,
        error_message: container.failure(),
        executor_endpoint: executor_endpoint.to_string(),
    }
}

pub fn build_heart_request(id: JobIdentity, executor_endpoint: &str) -> HeartRequest {
    HeartRequest {
        job_identity: id,
        executor_endpoint: executor_endpoint.to_string(),
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}
