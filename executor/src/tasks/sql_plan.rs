use std::{
    collections::HashMap,
    error::Error,
    fs,
    io::Read,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use common::job::{
    PARAM_DELIMITER, PARAM_ERROR_STRATEGY, PARAM_RETRY_INTERVAL_MILLIS, PARAM_RETRY_TIMES,
    PARAM_SQL_CONTENT, PARAM_SQL_OBJECT_IDS,
};
use common::TaskStatus;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::JobContext;
use crate::task::{StatusCell, Task};

const STOP_WAIT: Duration = Duration::from_secs(60);
const UTF8_BOM: &[u8] = &[0xef, 0xbb, 0xbf];
const ERROR_RECORDS_FILE: &str = "error-records.csv";

/// Qué hacer cuando una sentencia falla.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStrategy {
    /// corta el job en la primera sentencia fallida
    Abort,
    /// registra el fallo y sigue con la siguiente
    Continue,
}

impl FromStr for ErrorStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABORT" => Ok(ErrorStrategy::Abort),
            "CONTINUE" => Ok(ErrorStrategy::Continue),
            other => Err(format!("errorStrategy desconocida: {}", other)),
        }
    }
}

/// Resultado tipado de ejecutar una sentencia una vez.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    Succeeded { affected_rows: u64 },
    /// error de ejecución (timeout, conexión...): se puede reintentar
    Retryable { reason: String },
    /// la sentencia se ejecutó y falló: reintentar no sirve
    Failed { reason: String },
}

/// Sesión contra la base de datos (colaborador externo).
pub trait SqlSession: Send {
    fn execute(&mut self, sql: &str) -> StatementOutcome;

    fn close(&mut self) {}
}

pub trait SqlConnector: Send + Sync {
    fn connect(&self, context: &JobContext) -> Result<Box<dyn SqlSession>, String>;
}

/// Conector sin base de datos: registra cada sentencia y la da por buena.
#[derive(Debug, Default)]
pub struct DryRunConnector;

struct DryRunSession;

impl SqlSession for DryRunSession {
    fn execute(&mut self, sql: &str) -> StatementOutcome {
        info!("[dry-run] {}", sql);
        StatementOutcome::Succeeded { affected_rows: 0 }
    }
}

impl SqlConnector for DryRunConnector {
    fn connect(&self, _context: &JobContext) -> Result<Box<dyn SqlSession>, String> {
        Ok(Box::new(DryRunSession))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlPlanParameters {
    pub sql_content: Option<String>,
    pub sql_object_ids: Vec<String>,
    pub delimiter: String,
    pub retry_times: u32,
    pub retry_interval: Duration,
    pub error_strategy: ErrorStrategy,
}

impl Default for SqlPlanParameters {
    fn default() -> Self {
        Self {
            sql_content: None,
            sql_object_ids: Vec::new(),
            delimiter: ";".to_string(),
            retry_times: 0,
            retry_interval: Duration::from_millis(1000),
            error_strategy: ErrorStrategy::Abort,
        }
    }
}

impl SqlPlanParameters {
    pub fn from_map(params: &HashMap<String, String>) -> Result<Self, String> {
        let mut parsed = Self::default();
        parsed.sql_content = params
            .get(PARAM_SQL_CONTENT)
            .filter(|s| !s.trim().is_empty())
            .cloned();
        parsed.sql_object_ids = params
            .get(PARAM_SQL_OBJECT_IDS)
            .map(|ids| {
                ids.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(delimiter) = params.get(PARAM_DELIMITER).filter(|d| !d.is_empty()) {
            parsed.delimiter = delimiter.clone();
        }
        parsed.apply_tunables(params)?;

        if parsed.sql_content.is_none() && parsed.sql_object_ids.is_empty() {
            return Err("sqlContent y sqlObjectIds no pueden faltar a la vez".to_string());
        }
        Ok(parsed)
    }

    /// Parámetros que también se pueden cambiar en caliente.
    fn apply_tunables(&mut self, params: &HashMap<String, String>) -> Result<(), String> {
        if let Some(raw) = params.get(PARAM_RETRY_TIMES) {
            self.retry_times = raw
                .trim()
                .parse()
                .map_err(|_| format!("retryTimes inválido: {}", raw))?;
        }
        if let Some(raw) = params.get(PARAM_RETRY_INTERVAL_MILLIS) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| format!("retryIntervalMillis inválido: {}", raw))?;
            self.retry_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = params.get(PARAM_ERROR_STRATEGY) {
            self.error_strategy = raw.parse()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// posición de la sentencia, empezando en 1
    pub index: usize,
    pub sql: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SqlPlanResult {
    pub total_statements: usize,
    pub succeed_statements: usize,
    pub failed_statements: usize,
    pub error_records: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_records_object_id: Option<String>,
    /// causa cuando el job falla antes o fuera de las sentencias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Ejecuta un script SQL sentencia por sentencia, con reintentos y
/// estrategia de error configurables.
pub struct SqlPlanTask {
    connector: Arc<dyn SqlConnector>,
    status: StatusCell,
    canceled: AtomicBool,
    parameters: RwLock<SqlPlanParameters>,
    result: Mutex<SqlPlanResult>,
    session: Mutex<Option<Box<dyn SqlSession>>>,
}

impl SqlPlanTask {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self {
            connector,
            status: StatusCell::new(),
            canceled: AtomicBool::new(false),
            parameters: RwLock::new(SqlPlanParameters::default()),
            result: Mutex::new(SqlPlanResult::default()),
            session: Mutex::new(None),
        }
    }

    pub fn result(&self) -> SqlPlanResult {
        self.result.lock().clone()
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Ok(true) si todas las sentencias pasaron o la estrategia es CONTINUE.
    fn run(&self, context: &JobContext) -> Result<bool, String> {
        let params = SqlPlanParameters::from_map(context.parameters())?;
        *self.parameters.write() = params.clone();

        let script = load_script(context, &params)?;
        let statements = split_statements(&script, &params.delimiter);
        self.result.lock().total_statements = statements.len();
        info!("script con {} sentencias", statements.len());

        let mut session = self.connector.connect(context)?;
        let mut aborted = false;

        for (position, sql) in statements.iter().enumerate() {
            if self.is_canceled() {
                info!("cancelación aceptada antes de la sentencia {}", position + 1);
                break;
            }
            // los parámetros ajustables se releen en cada sentencia
            let params = self.parameters.read().clone();

            match self.execute_with_retries(session.as_mut(), sql, &params) {
                StatementOutcome::Succeeded { affected_rows } => {
                    info!("sentencia {} ok, filas={}", position + 1, affected_rows);
                    self.result.lock().succeed_statements += 1;
                }
                StatementOutcome::Retryable { reason } | StatementOutcome::Failed { reason } => {
                    warn!("sentencia {} falló: {}", position + 1, reason);
                    {
                        let mut result = self.result.lock();
                        result.failed_statements += 1;
                        result.error_records.push(ErrorRecord {
                            index: position + 1,
                            sql: sql.clone(),
                            reason: reason.clone(),
                        });
                    }
                    context
                        .exception_listener()
                        .on_exception(context.identity(), &reason);
                    if params.error_strategy == ErrorStrategy::Abort {
                        aborted = true;
                        break;
                    }
                }
            }
        }
        *self.session.lock() = Some(session);

        if let Err(e) = self.write_error_records(context) {
            // el artefacto es accesorio: el resultado ya tiene los errores
            warn!("no se pudo escribir el archivo de errores: {}", e);
        }

        let result = self.result.lock().clone();
        info!(
            "sql plan terminado: total={}, ok={}, fallidas={}",
            result.total_statements, result.succeed_statements, result.failed_statements
        );
        Ok(!aborted)
    }

    fn execute_with_retries(
        &self,
        session: &mut dyn SqlSession,
        sql: &str,
        params: &SqlPlanParameters,
    ) -> StatementOutcome {
        let mut retries = 0;
        loop {
            match session.execute(sql) {
                StatementOutcome::Retryable { reason }
                    if retries < params.retry_times && !self.is_canceled() =>
                {
                    retries += 1;
                    warn!(
                        "error ejecutando ({}), reintento {}/{} en {:?}",
                        reason, retries, params.retry_times, params.retry_interval
                    );
                    thread::sleep(params.retry_interval);
                }
                outcome => return outcome,
            }
        }
    }

    /// Escribe las sentencias fallidas en `error-records.csv` y lo sube al
    /// storage compartido.
    fn write_error_records(&self, context: &JobContext) -> Result<(), Box<dyn Error>> {
        let records = self.result.lock().error_records.clone();
        if records.is_empty() {
            return Ok(());
        }

        let dir = context.job_work_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(ERROR_RECORDS_FILE);
        let mut writer = csv::Writer::from_path(&path)?;
        for record in &records {
            writer.serialize(record)?;
        }
        writer.flush()?;

        if let Some(storage) = context.shared_storage().filter(|s| s.supported()) {
            let name = format!("{}-{}", context.identity(), ERROR_RECORDS_FILE);
            self.result.lock().error_records_object_id = Some(storage.upload(&name, &path)?);
        }
        Ok(())
    }
}

impl Task for SqlPlanTask {
    fn start(&self, context: &JobContext) -> bool {
        if !self.status.transition(TaskStatus::Running) {
            info!("tarea {} cancelada antes de arrancar", context.identity());
            return false;
        }

        match self.run(context) {
            Ok(success) => {
                let status = if self.is_canceled() {
                    TaskStatus::Canceled
                } else if success {
                    TaskStatus::Done
                } else {
                    warn!("hay sentencias con error y la estrategia es ABORT");
                    TaskStatus::Failed
                };
                self.status.transition(status);
                status == TaskStatus::Done
            }
            Err(reason) => {
                warn!("sql plan falló: {}", reason);
                self.result.lock().error_message = Some(reason);
                self.status.transition(TaskStatus::Failed);
                false
            }
        }
    }

    fn stop(&self) -> bool {
        self.canceled.store(true, Ordering::SeqCst);
        if self.status.get().is_terminal() {
            return true;
        }
        if self
            .status
            .compare_and_set(TaskStatus::Preparing, TaskStatus::Canceled)
        {
            return true;
        }
        self.status.transition(TaskStatus::Canceling);
        self.status.wait_terminal(STOP_WAIT).is_terminal()
    }

    fn modify(&self, parameters: &HashMap<String, String>) -> bool {
        let mut current = self.parameters.write();
        let mut updated = current.clone();
        match updated.apply_tunables(parameters) {
            Ok(()) if updated != *current => {
                *current = updated;
                info!("parámetros modificados: {:?}", parameters);
                true
            }
            Ok(()) => false,
            Err(reason) => {
                warn!("modify rechazado: {}", reason);
                false
            }
        }
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    fn progress(&self) -> f64 {
        let result = self.result.lock();
        if result.total_statements == 0 {
            return if self.status.get() == TaskStatus::Done { 100.0 } else { 0.0 };
        }
        let finished = result.succeed_statements + result.failed_statements;
        finished as f64 / result.total_statements as f64 * 100.0
    }

    fn task_result(&self) -> Value {
        serde_json::to_value(&*self.result.lock()).unwrap_or(Value::Null)
    }

    fn close(&self) {
        if let Some(mut session) = self.session.lock().take() {
            session.close();
        }
    }
}

/// Junta el script desde `sqlContent` o desde los objetos del storage.
fn load_script(context: &JobContext, params: &SqlPlanParameters) -> Result<String, String> {
    if let Some(content) = &params.sql_content {
        return Ok(content.clone());
    }

    let storage = match context.shared_storage() {
        Some(storage) if storage.supported() => storage,
        _ => return Err("object storage no disponible para leer sqlObjectIds".to_string()),
    };

    let mut script = String::new();
    for object_id in &params.sql_object_ids {
        let mut bytes = Vec::new();
        storage
            .get_object(object_id)
            .map_err(|e| e.to_string())?
            .read_to_end(&mut bytes)
            .map_err(|e| format!("leyendo {}: {}", object_id, e))?;
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| format!("el objeto {} no es UTF-8", object_id))?;
        script.push_str(&text);
        // que la última sentencia de un archivo no se pegue a la siguiente
        if !text.trim_end().ends_with(params.delimiter.as_str()) {
            script.push_str(&params.delimiter);
        }
        script.push('\n');
    }
    Ok(script)
}

/// Parte el script por el delimitador respetando comillas simples y dobles.
/// Las sentencias vacías se descartan.
pub fn split_statements(script: &str, delimiter: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut rest = script;

    while let Some(c) = rest.chars().next() {
        if quote.is_none() && !delimiter.is_empty() && rest.starts_with(delimiter) {
            push_statement(&mut statements, &mut current);
            rest = &rest[delimiter.len()..];
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            None if c == '\'' || c == '"' => quote = Some(c),
            _ => {}
        }
        current.push(c);
        rest = &rest[c.len_utf8()..];
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let sql = current.trim();
    if !sql.is_empty() {
        statements.push(sql.to_string());
    }
    current.clear();
}
