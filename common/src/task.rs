use serde::{Deserialize, Serialize};
use std::fmt;

/// Máquina de estados de una tarea:
/// PREPARING -> RUNNING -> {CANCELING -> CANCELED | DONE | FAILED}
///
/// DONE, FAILED y CANCELED son terminales y no admiten más transiciones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Preparing,
    Running,
    Canceling,
    Canceled,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled)
    }

    /// Transiciones válidas. Una tarea que nunca arrancó puede pasar
    /// directo a CANCELED o FAILED.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Preparing => matches!(next, Running | Canceled | Failed),
            Running => matches!(next, Canceling | Canceled | Done | Failed),
            Canceling => matches!(next, Canceled | Done | Failed),
            Canceled | Done | Failed => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Preparing => "PREPARING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Canceling => "CANCELING",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
