use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::job::JobIdentity;
use crate::task::TaskStatus;

/// Foto inmutable del estado de una tarea en un instante.
/// Se construye con copias propias del estado vivo, así que la tarea
/// puede seguir mutando mientras el reporte está en vuelo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub job_identity: JobIdentity,
    pub status: TaskStatus,
    /// Porcentaje en [0, 100]
    pub progress: f64,
    /// Resultado específico de la tarea (JSON libre)
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub executor_endpoint: String,
}

/// Prueba de vida del proceso executor (no de la tarea).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRequest {
    pub job_identity: JobIdentity,
    pub executor_endpoint: String,
}

/* --------- Claves de metadata de logs --------- */

pub const LOG_STORAGE_ALL_OBJECT_ID: &str = "log.storage.all.objectId";
pub const LOG_STORAGE_WARN_OBJECT_ID: &str = "log.storage.warn.objectId";
pub const LOG_STORAGE_FAILED_REASON: &str = "log.storage.failed.reason";
