use std::{
    collections::HashMap,
    fmt::{self, Write as _},
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use common::results::{LOG_STORAGE_ALL_OBJECT_ID, LOG_STORAGE_WARN_OBJECT_ID};
use common::JobIdentity;
use tracing::{
    field::{Field, Visit},
    span, Event, Level, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{ExecutorError, Result};
use crate::storage::ObjectStorage;

/// Nombre del campo de span que identifica al job.
pub const JOB_ID_FIELD: &str = "job_id";

const DEFAULT_FILTER: &str = "executor=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogType {
    All,
    Warn,
}

impl LogType {
    pub fn file_name(self) -> &'static str {
        match self {
            LogType::All => "all.log",
            LogType::Warn => "warn.log",
        }
    }

    fn metadata_key(self) -> &'static str {
        match self {
            LogType::All => LOG_STORAGE_ALL_OBJECT_ID,
            LogType::Warn => LOG_STORAGE_WARN_OBJECT_ID,
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogType::All => write!(f, "ALL"),
            LogType::Warn => write!(f, "WARN"),
        }
    }
}

impl FromStr for LogType {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(LogType::All),
            "WARN" => Ok(LogType::Warn),
            other => Err(ExecutorError::BadRequest(format!(
                "logType desconocido: {}",
                other
            ))),
        }
    }
}

/* --------- Captura: un archivo por job --------- */

/// Layer de tracing que copia los eventos emitidos dentro de un span con
/// `job_id` a `{root}/{job_id}/all.log` (y a `warn.log` si son WARN o ERROR).
pub struct JobLogLayer {
    root: PathBuf,
}

struct JobSpan(JobIdentity);

impl JobLogLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    fn append(&self, id: JobIdentity, log_type: LogType, line: &str) -> std::io::Result<()> {
        let dir = self.root.join(id.to_string());
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(log_type.file_name()))?;
        file.write_all(line.as_bytes())
    }
}

impl<S> Layer<S> for JobLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = JobIdVisitor(None);
        attrs.record(&mut visitor);
        if let (Some(job), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(JobSpan(job));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let job = ctx.event_scope(event).and_then(|scope| {
            scope.into_iter().find_map(|span| {
                let extensions = span.extensions();
                extensions.get::<JobSpan>().map(|j| j.0)
            })
        });
        let Some(job) = job else {
            return;
        };

        let mut message = MessageVisitor::default();
        event.record(&mut message);
        let metadata = event.metadata();
        let line = format!(
            "{} {:>5} {} - {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            metadata.level(),
            metadata.target(),
            message.finish()
        );

        // no se puede loguear desde acá: se perdería en el mismo layer
        let _ = self.append(job, LogType::All, &line);
        if *metadata.level() <= Level::WARN {
            let _ = self.append(job, LogType::Warn, &line);
        }
    }
}

struct JobIdVisitor(Option<JobIdentity>);

impl Visit for JobIdVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == JOB_ID_FIELD {
            self.0 = Some(JobIdentity::new(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == JOB_ID_FIELD && value >= 0 {
            self.0 = Some(JobIdentity::new(value as u64));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == JOB_ID_FIELD {
            self.0 = value.parse().ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == JOB_ID_FIELD {
            self.0 = format!("{:?}", value).parse().ok();
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// Arma el subscriber global: filtro por `RUST_LOG`, salida por consola y
/// archivos por job.
pub fn init_tracing(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(JobLogLayer::new(log_dir))
        .init();
    Ok(())
}

/* --------- Consulta y subida --------- */

/// Acceso a los logs capturados de cada job.
pub trait LogStore: Send + Sync {
    /// Lee desde el principio hasta `max_lines` líneas o `max_bytes` bytes,
    /// lo que llegue primero. Si se corta, agrega un aviso al final.
    fn get_log(
        &self,
        id: JobIdentity,
        log_type: LogType,
        max_lines: usize,
        max_bytes: usize,
    ) -> Result<String>;

    /// Sube los logs del job y devuelve la metadata con los object ids.
    fn upload_to_storage(
        &self,
        id: JobIdentity,
        storage: &dyn ObjectStorage,
    ) -> Result<HashMap<String, String>>;
}

#[derive(Debug, Clone)]
pub struct FileLogStore {
    root: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn log_path(&self, id: JobIdentity, log_type: LogType) -> PathBuf {
        self.root.join(id.to_string()).join(log_type.file_name())
    }
}

impl LogStore for FileLogStore {
    fn get_log(
        &self,
        id: JobIdentity,
        log_type: LogType,
        max_lines: usize,
        max_bytes: usize,
    ) -> Result<String> {
        let path = self.log_path(id, log_type);
        if !path.is_file() {
            return Err(ExecutorError::LogNotFound {
                id,
                log_type: log_type.to_string(),
            });
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut out = String::new();
        let mut lines = 0;
        let mut truncated = false;

        for line in reader.lines() {
            let line = line?;
            if lines >= max_lines || out.len() + line.len() + 1 > max_bytes {
                truncated = true;
                break;
            }
            out.push_str(&line);
            out.push('\n');
            lines += 1;
        }

        if truncated {
            let _ = writeln!(
                out,
                "... log truncado: límite de {} líneas o {} bytes",
                max_lines, max_bytes
            );
        }
        Ok(out)
    }

    fn upload_to_storage(
        &self,
        id: JobIdentity,
        storage: &dyn ObjectStorage,
    ) -> Result<HashMap<String, String>> {
        let mut metadata = HashMap::new();
        for log_type in [LogType::All, LogType::Warn] {
            let path = self.log_path(id, log_type);
            if !path.is_file() {
                continue;
            }
            let name = format!("{}-{}", id, log_type.file_name());
            let object_id = storage.upload(&name, &path)?;
            metadata.insert(log_type.metadata_key().to_string(), object_id);
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalObjectStorage;
    use std::io::Read;
    use tracing::{info, info_span, warn};
    use tracing_subscriber::Registry;

    fn write_lines(store: &FileLogStore, id: JobIdentity, lines: &[&str]) {
        let path = store.log_path(id, LogType::All);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn layer_separa_por_job_y_nivel() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = Registry::default().with(JobLogLayer::new(dir.path()));

        tracing::subscriber::with_default(subscriber, || {
            info!("fuera de cualquier job");
            let span = info_span!("job", job_id = 7u64);
            let _guard = span.enter();
            info!(filas = 3, "hola");
            warn!("cuidado");
        });

        let store = FileLogStore::new(dir.path());
        let all = store
            .get_log(JobIdentity::new(7), LogType::All, 100, 10_000)
            .unwrap();
        assert!(all.contains("hola filas=3"));
        assert!(all.contains("cuidado"));
        assert!(!all.contains("fuera de cualquier job"));

        let warn = store
            .get_log(JobIdentity::new(7), LogType::Warn, 100, 10_000)
            .unwrap();
        assert!(warn.contains("cuidado"));
        assert!(!warn.contains("hola"));
    }

    #[test]
    fn layer_recrea_el_directorio_borrado() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = Registry::default().with(JobLogLayer::new(dir.path()));

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("job", job_id = 8u64);
            let _guard = span.enter();
            info!("primero");
            fs::remove_dir_all(dir.path().join("8")).unwrap();
            info!("segundo");
        });

        let all = FileLogStore::new(dir.path())
            .get_log(JobIdentity::new(8), LogType::All, 100, 10_000)
            .unwrap();
        assert!(all.contains("segundo"));
        assert!(!all.contains("primero"));
    }

    #[test]
    fn get_log_corta_por_lineas_y_por_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path());
        let id = JobIdentity::new(1);
        write_lines(&store, id, &["uno", "dos", "tres"]);

        let full = store.get_log(id, LogType::All, 10, 1000).unwrap();
        assert_eq!(full, "uno\ndos\ntres\n");

        let by_lines = store.get_log(id, LogType::All, 2, 1000).unwrap();
        assert!(by_lines.starts_with("uno\ndos\n"));
        assert!(by_lines.contains("truncado"));
        assert!(!by_lines.contains("tres"));

        let by_bytes = store.get_log(id, LogType::All, 10, 5).unwrap();
        assert!(by_bytes.starts_with("uno\n"));
        assert!(!by_bytes.contains("dos"));
    }

    #[test]
    fn log_inexistente_es_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path());
        match store.get_log(JobIdentity::new(3), LogType::Warn, 10, 10) {
            Err(ExecutorError::LogNotFound { log_type, .. }) => assert_eq!(log_type, "WARN"),
            other => panic!("esperaba LogNotFound, obtuve {:?}", other),
        }
    }

    #[test]
    fn sube_los_logs_existentes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::new(dir.path().join("logs"));
        let storage = LocalObjectStorage::new(dir.path().join("objects")).unwrap();
        let id = JobIdentity::new(4);
        write_lines(&store, id, &["linea"]);

        let metadata = store.upload_to_storage(id, &storage).unwrap();
        assert_eq!(metadata.len(), 1);
        let object_id = &metadata[LOG_STORAGE_ALL_OBJECT_ID];

        let mut body = String::new();
        storage
            .get_object(object_id)
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "linea\n");
    }

    #[test]
    fn log_type_se_parsea_sin_importar_mayusculas() {
        assert_eq!("warn".parse::<LogType>().unwrap(), LogType::Warn);
        assert_eq!("ALL".parse::<LogType>().unwrap(), LogType::All);
        assert!("debug".parse::<LogType>().is_err());
    }
}
