use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, num::ParseIntError, str::FromStr};

/// Identidad opaca de un job. La asigna el coordinador al enviar el job
/// y es la única clave que relaciona tarea, monitor y mensajes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(u64);

impl JobIdentity {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobIdentity {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobIdentity {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Petición de alta de un job: qué tipo de tarea y con qué parámetros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub job_identity: JobIdentity,
    /// Clave registrada en la tabla de fábricas, ej: "SQL_PLAN"
    pub task_kind: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/* --------- Claves de parámetros de job --------- */

/// Timeout de ejecución en milisegundos; lo vigila el monitor.
pub const PARAM_TIMEOUT_MILLIS: &str = "timeoutMillis";

pub const PARAM_SQL_CONTENT: &str = "sqlContent";
/// Lista de object ids separada por comas
pub const PARAM_SQL_OBJECT_IDS: &str = "sqlObjectIds";
pub const PARAM_DELIMITER: &str = "delimiter";
pub const PARAM_RETRY_TIMES: &str = "retryTimes";
pub const PARAM_RETRY_INTERVAL_MILLIS: &str = "retryIntervalMillis";
pub const PARAM_ERROR_STRATEGY: &str = "errorStrategy";

pub const PARAM_SLEEP_MILLIS: &str = "sleepMillis";
pub const PARAM_POLL_MILLIS: &str = "pollMillis";

/* --------- Tipos de tarea conocidos --------- */

pub const TASK_KIND_SQL_PLAN: &str = "SQL_PLAN";
pub const TASK_KIND_SLEEP: &str = "SLEEP";
