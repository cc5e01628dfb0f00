use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use common::job::PARAM_TIMEOUT_MILLIS;
use common::results::LOG_STORAGE_FAILED_REASON;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::ExecutorConfig;
use crate::error::root_cause_message;
use crate::logs::LogStore;
use crate::reporter::{ReportEndpoint, TaskReporter};
use crate::result::{build_heart_request, build_task_result, TaskContainer};

/// Cadencias y destino de los reportes de un monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub executor_endpoint: String,
    pub report_enabled: bool,
    pub report_delay: Duration,
    pub report_interval: Duration,
    pub heartbeat_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&ExecutorConfig> for MonitorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            executor_endpoint: config.executor_endpoint.clone(),
            report_enabled: config.report_enabled(),
            report_delay: config.report_delay,
            report_interval: config.report_interval,
            heartbeat_delay: config.heartbeat_delay,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

/// Vigila una tarea mientras vive: reporta progreso y heartbeats, aplica el
/// timeout y, al terminar, sube los logs y entrega el reporte final.
pub struct TaskMonitor {
    container: Arc<TaskContainer>,
    reporter: Arc<dyn TaskReporter>,
    log_store: Arc<dyn LogStore>,
    settings: MonitorSettings,
    started_at: Instant,
    timeout_fired: AtomicBool,

    log_metadata: Mutex<Option<HashMap<String, String>>>,
    log_meta_ready: AtomicBool,
    log_meta_consumed: AtomicBool,
    log_meta_pulled: Notify,

    final_reported: AtomicBool,
    // serializa los reportes de resultado: un tick no pisa al reporte final
    report_lock: tokio::sync::Mutex<()>,
    schedulers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskMonitor {
    pub fn new(
        container: Arc<TaskContainer>,
        reporter: Arc<dyn TaskReporter>,
        log_store: Arc<dyn LogStore>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            container,
            reporter,
            log_store,
            settings,
            started_at: Instant::now(),
            timeout_fired: AtomicBool::new(false),
            log_metadata: Mutex::new(None),
            log_meta_ready: AtomicBool::new(false),
            log_meta_consumed: AtomicBool::new(false),
            log_meta_pulled: Notify::new(),
            final_reported: AtomicBool::new(false),
            report_lock: tokio::sync::Mutex::new(()),
            schedulers: Mutex::new(Vec::new()),
        }
    }

    pub fn container(&self) -> &Arc<TaskContainer> {
        &self.container
    }

    fn span(&self) -> Span {
        info_span!("job", job_id = self.container.identity().value())
    }

    /// Arranca los loops de reporte y heartbeat.
    pub fn start(self: &Arc<Self>) {
        let mut schedulers = self.schedulers.lock();

        let monitor = Arc::clone(self);
        let report = tokio::spawn(
            async move {
                let mut ticker = time::interval_at(
                    Instant::now() + monitor.settings.report_delay,
                    monitor.settings.report_interval,
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    monitor.report_tick().await;
                }
            }
            .instrument(self.span()),
        );
        schedulers.push(report);

        if self.settings.report_enabled {
            let monitor = Arc::clone(self);
            let heartbeat = tokio::spawn(
                async move {
                    let mut ticker = time::interval_at(
                        Instant::now() + monitor.settings.heartbeat_delay,
                        monitor.settings.heartbeat_interval,
                    );
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        monitor.heartbeat_tick().await;
                    }
                }
                .instrument(self.span()),
            );
            schedulers.push(heartbeat);
        }
    }

    /// Timeout configurado en los parámetros del job, si hay.
    fn timeout(&self) -> Option<Duration> {
        self.container
            .context()
            .parameter(PARAM_TIMEOUT_MILLIS)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timeout()
            .map(|timeout| self.started_at.elapsed() > timeout)
            .unwrap_or(false)
    }

    async fn report_tick(&self) {
        if self.is_timed_out()
            && !self.container.is_terminal()
            && !self.timeout_fired.swap(true, Ordering::SeqCst)
        {
            warn!(
                "la tarea superó su timeout ({:?}), se pide stop",
                self.timeout().unwrap_or_default()
            );
            let task = Arc::clone(self.container.task());
            // no se espera: el tick siguiente no tiene por qué bloquearse
            tokio::task::spawn_blocking(move || {
                let stopped = task.stop();
                info!("stop por timeout devolvió {}", stopped);
            });
        }

        if !self.settings.report_enabled {
            return;
        }
        if build_task_result(&self.container, &self.settings.executor_endpoint, None)
            .status
            .is_terminal()
        {
            // el terminal lo manda final_work
            return;
        }

        let _guard = self.report_lock.lock().await;
        if self.final_reported.load(Ordering::SeqCst) {
            return;
        }
        let result = build_task_result(&self.container, &self.settings.executor_endpoint, None);
        if result.status.is_terminal() {
            return;
        }
        match self.send(ReportEndpoint::TaskResultUpload, &result).await {
            Ok(true) => debug!("progreso reportado: {:.1}%", result.progress),
            Ok(false) => warn!("el coordinador no confirmó el reporte de progreso"),
            Err(e) => warn!("no se pudo reportar el progreso: {}", e),
        }
    }

    async fn heartbeat_tick(&self) {
        let heart = build_heart_request(
            self.container.identity(),
            &self.settings.executor_endpoint,
        );
        if let Err(e) = self.send(ReportEndpoint::TaskHeart, &heart).await {
            warn!("heartbeat falló: {}", e);
        }
    }

    async fn send<T: serde::Serialize + Sync>(
        &self,
        endpoint: ReportEndpoint,
        payload: &T,
    ) -> crate::error::Result<bool> {
        let payload: Value = serde_json::to_value(payload)?;
        self.reporter.report(endpoint, payload).await
    }

    /// Cierre del monitor. Se llama una vez, cuando `start` de la tarea ya volvió.
    pub async fn final_work(&self) {
        let span = self.span();
        self.finalize().instrument(span).await;
        self.stop_schedulers();
    }

    async fn finalize(&self) {
        let id = self.container.identity();
        let metadata = self.upload_logs().await;
        *self.log_metadata.lock() = Some(metadata.clone());
        self.log_meta_ready.store(true, Ordering::SeqCst);

        if !self.settings.report_enabled {
            info!("sin coordinador: se espera a que pidan el resultado de {}", id);
            while !self.log_meta_consumed.load(Ordering::SeqCst) {
                self.log_meta_pulled.notified().await;
            }
            info!("resultado de {} entregado", id);
            return;
        }

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            {
                let _guard = self.report_lock.lock().await;
                let result = build_task_result(
                    &self.container,
                    &self.settings.executor_endpoint,
                    Some(metadata.clone()),
                );
                match self.send(ReportEndpoint::TaskResultUpload, &result).await {
                    Ok(true) => {
                        self.final_reported.store(true, Ordering::SeqCst);
                        info!(
                            "reporte final entregado (estado={}, intento {})",
                            result.status, attempt
                        );
                        return;
                    }
                    Ok(false) => warn!("reporte final sin confirmar (intento {})", attempt),
                    Err(e) => warn!("reporte final falló (intento {}): {}", attempt, e),
                }
            }
            time::sleep(self.settings.report_interval).await;
        }
    }

    /// Sube los logs si hay un storage que lo soporte. Nunca falla: un error
    /// queda anotado en la metadata.
    async fn upload_logs(&self) -> HashMap<String, String> {
        let storage = match self.container.context().shared_storage() {
            Some(storage) if storage.supported() => Arc::clone(storage),
            _ => return HashMap::new(),
        };
        let id = self.container.identity();
        let log_store = Arc::clone(&self.log_store);

        let upload =
            tokio::task::spawn_blocking(move || log_store.upload_to_storage(id, storage.as_ref()))
                .await;
        let failure = match upload {
            Ok(Ok(metadata)) => {
                info!("logs subidos: {:?}", metadata);
                return metadata;
            }
            Ok(Err(e)) => root_cause_message(&e),
            Err(e) => e.to_string(),
        };

        warn!("no se pudieron subir los logs: {}", failure);
        let mut metadata = HashMap::new();
        metadata.insert(LOG_STORAGE_FAILED_REASON.to_string(), failure);
        metadata
    }

    /// Devuelve la metadata de logs una sola vez, cuando ya está lista.
    pub fn take_log_metadata(&self) -> Option<HashMap<String, String>> {
        if !self.log_meta_ready.load(Ordering::SeqCst) {
            return None;
        }
        if self
            .log_meta_consumed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let metadata = self.log_metadata.lock().clone();
        self.log_meta_pulled.notify_one();
        metadata
    }

    pub fn is_final_reported(&self) -> bool {
        self.final_reported.load(Ordering::SeqCst)
    }

    pub fn stop_schedulers(&self) {
        for handle in self.schedulers.lock().drain(..) {
            handle.abort();
        }
    }
}
