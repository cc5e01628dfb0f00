use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use common::JobIdentity;
use tracing::warn;

use crate::storage::ObjectStorage;

/// Recibe los errores que una tarea decide tolerar (ej: estrategia CONTINUE).
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, id: JobIdentity, message: &str);
}

/// Listener por defecto: sólo deja constancia en el log.
#[derive(Debug, Default)]
pub struct LoggingExceptionListener;

impl ExceptionListener for LoggingExceptionListener {
    fn on_exception(&self, id: JobIdentity, message: &str) {
        warn!(job_id = %id, "la tarea toleró un error: {}", message);
    }
}

/// Contexto de un job. Inmutable una vez creado; clonarlo es barato.
#[derive(Clone)]
pub struct JobContext {
    identity: JobIdentity,
    parameters: Arc<HashMap<String, String>>,
    shared_storage: Option<Arc<dyn ObjectStorage>>,
    exception_listener: Arc<dyn ExceptionListener>,
    work_dir: PathBuf,
}

impl JobContext {
    pub fn new(identity: JobIdentity, parameters: HashMap<String, String>) -> Self {
        Self {
            identity,
            parameters: Arc::new(parameters),
            shared_storage: None,
            exception_listener: Arc::new(LoggingExceptionListener),
            work_dir: std::env::temp_dir().join("executor").join("work"),
        }
    }

    pub fn with_shared_storage(mut self, storage: Option<Arc<dyn ObjectStorage>>) -> Self {
        self.shared_storage = storage;
        self
    }

    pub fn with_exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = listener;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn identity(&self) -> JobIdentity {
        self.identity
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn shared_storage(&self) -> Option<&Arc<dyn ObjectStorage>> {
        self.shared_storage.as_ref()
    }

    pub fn exception_listener(&self) -> &Arc<dyn ExceptionListener> {
        &self.exception_listener
    }

    /// Directorio de trabajo propio del job: {work_dir}/{job_id}
    pub fn job_work_dir(&self) -> PathBuf {
        self.work_dir.join(self.identity.to_string())
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("identity", &self.identity)
            .field("parameters", &self.parameters)
            .field("shared_storage", &self.shared_storage.is_some())
            .field("work_dir", &self.work_dir)
            .finish()
    }
}
