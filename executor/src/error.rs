use std::error::Error as StdError;

use common::{ErrorCode, JobIdentity};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("no hay tarea registrada para el job {0}")]
    TaskNotFound(JobIdentity),

    #[error("el job {0} ya está registrado")]
    AlreadyRegistered(JobIdentity),

    #[error("tipo de tarea desconocido: {0}")]
    UnknownTaskKind(String),

    #[error("petición inválida: {0}")]
    BadRequest(String),

    #[error("no hay log {log_type} para el job {id}")]
    LogNotFound { id: JobIdentity, log_type: String },

    #[error("configuración inválida: {0}")]
    Config(String),

    #[error("error de object storage: {0}")]
    Storage(String),

    #[error("el executor se está apagando")]
    ShuttingDown,

    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error de serialización: {0}")]
    Json(#[from] serde_json::Error),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error interno: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Código del sobre de respuesta del plano de control.
    pub fn code(&self) -> ErrorCode {
        match self {
            ExecutorError::TaskNotFound(_) | ExecutorError::LogNotFound { .. } => {
                ErrorCode::NotFound
            }
            ExecutorError::BadRequest(_)
            | ExecutorError::UnknownTaskKind(_)
            | ExecutorError::AlreadyRegistered(_)
            | ExecutorError::Json(_) => ErrorCode::BadRequest,
            _ => ErrorCode::Internal,
        }
    }
}

/// Mensaje de la causa raíz recorriendo la cadena de `source()`.
pub fn root_cause_message(err: &(dyn StdError + 'static)) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn causa_raiz_de_un_error_envuelto() {
        let err = ExecutorError::Io(io::Error::new(io::ErrorKind::Other, "disco lleno"));
        // thiserror expone el io::Error como source
        assert_eq!(root_cause_message(&err), "disco lleno");
    }

    #[test]
    fn codigos_del_plano_de_control() {
        assert_eq!(
            ExecutorError::TaskNotFound(JobIdentity::new(1)).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            ExecutorError::BadRequest("x".into()).code(),
            ErrorCode::BadRequest
        );
        assert_eq!(ExecutorError::ShuttingDown.code(), ErrorCode::Internal);
    }
}
