use crate::job::JobIdentity;

/* --------- Endpoints del coordinador --------- */

pub const TASK_RESULT_UPLOAD: &str = "/api/v2/task/result";
pub const TASK_HEART: &str = "/api/v2/task/heart";

/* --------- Endpoints del executor --------- */

pub const HEALTH: &str = "/health";
pub const SUBMIT_JOB: &str = "/api/v1/jobs";

// Plano de control: cada ruta termina en /{id}
pub const QUERY_LOG: &str = "/task/log";
pub const STOP_TASK: &str = "/task/stop";
pub const GET_RESULT: &str = "/task/result";
pub const MODIFY_PARAMETERS: &str = "/task/modify";

pub const QUERY_LOG_TYPE: &str = "logType";
pub const QUERY_FETCH_MAX_LINE: &str = "fetchMaxLine";
pub const QUERY_FETCH_MAX_BYTE_SIZE: &str = "fetchMaxByteSize";

/// Arma la ruta de control para un job, ej: /task/stop/42
pub fn job_path(base: &str, id: JobIdentity) -> String {
    format!("{}/{}", base, id)
}
