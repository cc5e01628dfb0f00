use std::{env, path::PathBuf, time::Duration};

use crate::error::ExecutorError;

const DEFAULT_PORT: u16 = 8990;
const DEFAULT_POOL_SIZE: usize = 2;
const DEFAULT_REPORT_DELAY_SECS: u64 = 1;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_DELAY_SECS: u64 = 1;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const DEFAULT_CANCEL_WAIT_SECS: u64 = 10;
const DEFAULT_REPORT_HTTP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_TASK_RETENTION_SECS: u64 = 60;
const DEFAULT_LOG_FETCH_MAX_LINES: usize = 10_000;
const DEFAULT_LOG_FETCH_MAX_BYTES: usize = 1024 * 1024;

/// Configuración del proceso executor.
/// Todo se puede sobreescribir con variables de entorno (ver `from_env`).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub port: u16,
    /// URL con la que el coordinador llega a este executor
    pub executor_endpoint: String,
    /// Tamaño fijo del pool de workers
    pub pool_size: usize,
    /// URLs base del coordinador. Vacío = nadie recibe reportes (modo pull).
    pub coordinator_urls: Vec<String>,
    pub report_delay: Duration,
    pub report_interval: Duration,
    pub heartbeat_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Espera acotada de `cancel` antes de mirar el estado observado
    pub cancel_wait: Duration,
    pub report_http_timeout: Duration,
    /// Cuánto vive una entrada del registro tras el reporte final.
    /// `None` = no se borra nunca.
    pub task_retention: Option<Duration>,
    pub log_dir: PathBuf,
    pub work_dir: PathBuf,
    /// Directorio del object storage local (opcional)
    pub storage_dir: Option<PathBuf>,
    pub log_fetch_max_lines: usize,
    pub log_fetch_max_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let base = env::temp_dir().join("executor");
        Self {
            port: DEFAULT_PORT,
            executor_endpoint: format!("http://localhost:{}", DEFAULT_PORT),
            pool_size: DEFAULT_POOL_SIZE,
            coordinator_urls: Vec::new(),
            report_delay: Duration::from_secs(DEFAULT_REPORT_DELAY_SECS),
            report_interval: Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS),
            heartbeat_delay: Duration::from_secs(DEFAULT_HEARTBEAT_DELAY_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            cancel_wait: Duration::from_secs(DEFAULT_CANCEL_WAIT_SECS),
            report_http_timeout: Duration::from_secs(DEFAULT_REPORT_HTTP_TIMEOUT_SECS),
            task_retention: Some(Duration::from_secs(DEFAULT_TASK_RETENTION_SECS)),
            log_dir: base.join("logs"),
            work_dir: base.join("work"),
            storage_dir: None,
            log_fetch_max_lines: DEFAULT_LOG_FETCH_MAX_LINES,
            log_fetch_max_bytes: DEFAULT_LOG_FETCH_MAX_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ExecutorError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables inyectable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ExecutorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "EXECUTOR_PORT")? {
            config.port = port;
        }
        config.executor_endpoint = match lookup("EXECUTOR_ENDPOINT") {
            Some(endpoint) if !endpoint.trim().is_empty() => endpoint.trim().to_string(),
            _ => format!("http://{}:{}", local_hostname(), config.port),
        };

        if let Some(size) = parse_var::<usize, _>(&lookup, "EXECUTOR_POOL_SIZE")? {
            if size == 0 {
                return Err(ExecutorError::Config(
                    "EXECUTOR_POOL_SIZE tiene que ser mayor que 0".to_string(),
                ));
            }
            config.pool_size = size;
        }

        if let Some(urls) = lookup("COORDINATOR_URLS") {
            config.coordinator_urls = urls
                .split(',')
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }

        if let Some(secs) = parse_var(&lookup, "REPORT_DELAY_SECS")? {
            config.report_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "REPORT_INTERVAL_SECS")? {
            config.report_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "HEARTBEAT_DELAY_SECS")? {
            config.heartbeat_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "CANCEL_WAIT_SECS")? {
            config.cancel_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "REPORT_HTTP_TIMEOUT_SECS")? {
            config.report_http_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TASK_RETENTION_SECS")? {
            // 0 = no se borra nunca
            config.task_retention = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(dir) = lookup("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        config.storage_dir = lookup("STORAGE_DIR")
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from);

        if let Some(lines) = parse_var(&lookup, "LOG_FETCH_MAX_LINES")? {
            config.log_fetch_max_lines = lines;
        }
        if let Some(bytes) = parse_var(&lookup, "LOG_FETCH_MAX_BYTES")? {
            config.log_fetch_max_bytes = bytes;
        }

        if config.report_interval.is_zero() || config.heartbeat_interval.is_zero() {
            return Err(ExecutorError::Config(
                "los intervalos de reporte y heartbeat no pueden ser 0".to_string(),
            ));
        }

        Ok(config)
    }

    /// Sin coordinador no hay a quién reportar.
    pub fn report_enabled(&self) -> bool {
        !self.coordinator_urls.is_empty()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ExecutorError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExecutorError::Config(format!("{} inválido: {:?}", key, raw))),
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
