use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use common::{JobIdentity, TaskStatus};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
    time,
};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ExecutorConfig;
use crate::context::{ExceptionListener, JobContext, LoggingExceptionListener};
use crate::error::{ExecutorError, Result};
use crate::logs::LogStore;
use crate::monitor::{MonitorSettings, TaskMonitor};
use crate::reporter::TaskReporter;
use crate::result::TaskContainer;
use crate::storage::ObjectStorage;
use crate::task::Task;

/// Entrada del registro: la tarea, su contexto y su monitor.
pub struct RunningTask {
    container: Arc<TaskContainer>,
    monitor: Arc<TaskMonitor>,
    finished: watch::Receiver<bool>,
}

impl RunningTask {
    pub fn identity(&self) -> JobIdentity {
        self.container.identity()
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        self.container.task()
    }

    pub fn container(&self) -> &Arc<TaskContainer> {
        &self.container
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    pub fn status(&self) -> TaskStatus {
        self.container.status()
    }

    /// `true` cuando el worker terminó y el monitor cerró.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub async fn wait_finished(&self) {
        let mut finished = self.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

/// Pool de workers más registro de tareas vivas.
///
/// Como mucho `pool_size` tareas corren a la vez; el resto espera turno en
/// orden de llegada. Cada tarea registrada tiene su monitor desde que se
/// acepta hasta que el reporte final fue entregado.
pub struct Executor {
    config: ExecutorConfig,
    monitor_settings: MonitorSettings,
    pool: Arc<Semaphore>,
    tasks: DashMap<JobIdentity, Arc<RunningTask>>,
    reporter: Arc<dyn TaskReporter>,
    log_store: Arc<dyn LogStore>,
    shared_storage: Option<Arc<dyn ObjectStorage>>,
    exception_listener: Arc<dyn ExceptionListener>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        reporter: Arc<dyn TaskReporter>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            monitor_settings: MonitorSettings::from(&config),
            pool: Arc::new(Semaphore::new(config.pool_size)),
            tasks: DashMap::new(),
            reporter,
            log_store,
            shared_storage: None,
            exception_listener: Arc::new(LoggingExceptionListener),
            config,
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

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn log_store(&self) -> &Arc<dyn LogStore> {
        &self.log_store
    }

    /// Contexto para un job nuevo con el storage, listener y work dir del executor.
    pub fn job_context(&self, id: JobIdentity, parameters: HashMap<String, String>) -> JobContext {
        JobContext::new(id, parameters)
            .with_shared_storage(self.shared_storage.clone())
            .with_exception_listener(Arc::clone(&self.exception_listener))
            .with_work_dir(self.config.work_dir.clone())
    }

    /// Registra la tarea, arranca su monitor y la encola en el pool.
    pub fn execute(
        self: &Arc<Self>,
        task: Arc<dyn Task>,
        context: JobContext,
    ) -> Result<Arc<RunningTask>> {
        let id = context.identity();
        let container = Arc::new(TaskContainer::new(task, context));
        let monitor = Arc::new(TaskMonitor::new(
            Arc::clone(&container),
            Arc::clone(&self.reporter),
            Arc::clone(&self.log_store),
            self.monitor_settings.clone(),
        ));
        let (done_tx, done_rx) = watch::channel(false);
        let running = Arc::new(RunningTask {
            container,
            monitor,
            finished: done_rx,
        });

        match self.tasks.entry(id) {
            Entry::Occupied(_) => return Err(ExecutorError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&running));
            }
        }

        running.monitor.start();
        let executor = Arc::clone(self);
        let worker = Arc::clone(&running);
        tokio::spawn(async move { executor.run_worker(worker, done_tx).await });

        info!(
            "job {} encolado (slots libres={})",
            id,
            self.pool.available_permits()
        );
        Ok(running)
    }

    async fn run_worker(self: Arc<Self>, running: Arc<RunningTask>, done: watch::Sender<bool>) {
        let id = running.identity();
        let span = info_span!("job", job_id = id.value());

        match Arc::clone(&self.pool).acquire_owned().await {
            Ok(permit) => {
                let container = Arc::clone(&running.container);
                let body_span = span.clone();
                let body = tokio::task::spawn_blocking(move || {
                    let _entered = body_span.enter();
                    run_body(&container);
                    // el slot se libera antes de la finalización
                    drop(permit);
                });
                if let Err(e) = body.await {
                    error!(parent: &span, "el worker del job {} terminó mal: {}", id, e);
                    running.container.record_failure(format!("worker abortado: {}", e));
                }
            }
            Err(_) => {
                warn!(parent: &span, "pool cerrado: el job {} no llegó a correr", id);
                running
                    .container
                    .record_failure(ExecutorError::ShuttingDown.to_string());
                close_task(&running.container);
            }
        }

        running.monitor.final_work().await;
        let _ = done.send(true);
        info!(parent: &span, "job {} finalizado en {}", id, running.status());

        self.schedule_eviction(running);
    }

    fn schedule_eviction(self: Arc<Self>, running: Arc<RunningTask>) {
        let Some(retention) = self.config.task_retention else {
            return;
        };
        tokio::spawn(async move {
            time::sleep(retention).await;
            let id = running.identity();
            // sólo si la entrada sigue siendo la misma tarea
            if self
                .tasks
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &running))
                .is_some()
            {
                info!("job {} sacado del registro", id);
            }
        });
    }

    pub fn get_task(&self, id: JobIdentity) -> Option<Arc<RunningTask>> {
        self.tasks.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pide stop y espera como mucho `cancel_wait`. Si la espera vence, el
    /// resultado sale del estado observado; la tarea nunca se mata.
    pub async fn cancel(&self, id: JobIdentity) -> bool {
        let Some(running) = self.get_task(id) else {
            info!("cancel de {}: no hay tarea registrada", id);
            return false;
        };
        let span = info_span!("job", job_id = id.value());
        self.cancel_running(running).instrument(span).await
    }

    async fn cancel_running(&self, running: Arc<RunningTask>) -> bool {
        let task = Arc::clone(running.task());
        let stop = tokio::task::spawn_blocking(move || task.stop());

        match time::timeout(self.config.cancel_wait, stop).await {
            Ok(Ok(stopped)) => {
                let stopped = stopped || running.container.is_terminal();
                info!("stop devolvió, cancelada={} estado={}", stopped, running.status());
                stopped
            }
            Ok(Err(e)) => {
                warn!("stop terminó mal: {}", e);
                running.container.is_terminal()
            }
            Err(_) => {
                let status = running.status();
                if status.is_terminal() {
                    info!("stop no volvió a tiempo pero la tarea ya está en {}", status);
                    true
                } else {
                    warn!(
                        "la tarea sigue corriendo ({}) tras esperar {:?}",
                        status, self.config.cancel_wait
                    );
                    false
                }
            }
        }
    }

    /// Cierra el pool (lo encolado termina FAILED) y cancela lo que corre.
    pub async fn shutdown(self: &Arc<Self>) {
        self.pool.close();
        let ids: Vec<JobIdentity> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| *entry.key())
            .collect();
        info!("apagando executor: {} tareas vivas", ids.len());

        let mut cancels = JoinSet::new();
        for id in ids {
            let executor = Arc::clone(self);
            cancels.spawn(async move { (id, executor.cancel(id).await) });
        }
        while let Some(joined) = cancels.join_next().await {
            match joined {
                Ok((id, true)) => info!("job {} cancelado", id),
                Ok((id, false)) => warn!("job {} no paró a tiempo", id),
                Err(e) => warn!("cancel abortado: {}", e),
            }
        }
    }
}

/// Corre `start` atrapando pánicos y después `close`, una sola vez.
fn run_body(container: &TaskContainer) {
    info!("arrancando tarea {}", container.identity());
    let task = container.task();

    match panic::catch_unwind(AssertUnwindSafe(|| task.start(container.context()))) {
        Ok(true) => info!("start terminó ok ({})", container.status()),
        Ok(false) => {
            if !task.status().is_terminal() {
                container.record_failure("start devolvió false sin llegar a un estado terminal");
            }
            warn!("start terminó sin éxito ({})", container.status());
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("la tarea entró en pánico: {}", message);
            container.record_failure(format!("panic: {}", message));
        }
    }

    close_task(container);
}

fn close_task(container: &TaskContainer) {
    let task = container.task();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.close())) {
        warn!("close entró en pánico: {}", panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "pánico sin mensaje".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::FileLogStore;
    use crate::reporter::ReportEndpoint;
    use crate::tasks::sleep::SleepTask;
    use crate::testing::{RecordingReporter, ScriptedTask, StartBehavior};
    use common::job::{PARAM_POLL_MILLIS, PARAM_SLEEP_MILLIS, PARAM_TIMEOUT_MILLIS};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn test_config(pool_size: usize) -> ExecutorConfig {
        let base = std::env::temp_dir().join("executor-tests");
        ExecutorConfig {
            pool_size,
            coordinator_urls: vec!["http://coordinator".to_string()],
            report_delay: Duration::from_millis(10),
            report_interval: Duration::from_millis(20),
            heartbeat_delay: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            cancel_wait: Duration::from_secs(2),
            task_retention: None,
            log_dir: base.join("logs"),
            work_dir: base.join("work"),
            ..ExecutorConfig::default()
        }
    }

    fn executor_with(config: ExecutorConfig) -> (Arc<Executor>, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::new());
        let log_store = Arc::new(FileLogStore::new(config.log_dir.clone()));
        let executor = Arc::new(Executor::new(config, reporter.clone(), log_store));
        (executor, reporter)
    }

    fn submit(executor: &Arc<Executor>, id: u64, task: Arc<ScriptedTask>) -> Arc<RunningTask> {
        let context = executor.job_context(JobIdentity::new(id), HashMap::new());
        executor.execute(task, context).unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(time::Instant::now() < deadline, "la condición nunca se cumplió");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pool_de_dos_encola_la_tercera() {
        let (executor, _) = executor_with(test_config(2));
        let tasks: Vec<Arc<ScriptedTask>> =
            (0..3).map(|_| Arc::new(ScriptedTask::new())).collect();
        let running: Vec<_> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| submit(&executor, i as u64 + 1, Arc::clone(t)))
            .collect();

        wait_until(|| {
            tasks[0].status() == TaskStatus::Running && tasks[1].status() == TaskStatus::Running
        })
        .await;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tasks[2].starts.load(Ordering::SeqCst), 0);
        assert_eq!(tasks[2].status(), TaskStatus::Preparing);

        tasks[0].release();
        wait_until(|| tasks[2].status() == TaskStatus::Running).await;

        tasks[1].release();
        tasks[2].release();
        for r in &running {
            r.wait_finished().await;
            assert_eq!(r.status(), TaskStatus::Done);
        }
        for t in &tasks {
            assert_eq!(t.close_count(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_cancela_una_tarea_que_duerme() {
        let (executor, _) = executor_with(test_config(2));
        let params = [
            (PARAM_TIMEOUT_MILLIS, "500"),
            (PARAM_SLEEP_MILLIS, "5000"),
            (PARAM_POLL_MILLIS, "100"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let context = executor.job_context(JobIdentity::new(90), params);

        let started = time::Instant::now();
        let running = executor.execute(Arc::new(SleepTask::new()), context).unwrap();
        running.wait_finished().await;

        assert_eq!(running.status(), TaskStatus::Canceled);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(700), "{:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identidad_duplicada_se_rechaza() {
        let (executor, _) = executor_with(test_config(1));
        let first = Arc::new(ScriptedTask::new());
        submit(&executor, 7, Arc::clone(&first));

        let context = executor.job_context(JobIdentity::new(7), HashMap::new());
        match executor.execute(Arc::new(ScriptedTask::new()), context) {
            Err(ExecutorError::AlreadyRegistered(id)) => assert_eq!(id, JobIdentity::new(7)),
            other => panic!("esperaba AlreadyRegistered, obtuve {:?}", other.err()),
        }
        first.release();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_de_desconocido_es_false() {
        let (executor, _) = executor_with(test_config(1));
        assert!(!executor.cancel(JobIdentity::new(404)).await);
        assert!(executor.get_task(JobIdentity::new(404)).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_para_la_tarea_y_se_reporta_una_vez() {
        let (executor, reporter) = executor_with(test_config(1));
        let task = Arc::new(ScriptedTask::new());
        let running = submit(&executor, 1, Arc::clone(&task));
        wait_until(|| task.status() == TaskStatus::Running).await;

        assert!(executor.cancel(JobIdentity::new(1)).await);
        // cancelar de nuevo una tarea terminada también es éxito
        assert!(executor.cancel(JobIdentity::new(1)).await);

        running.wait_finished().await;
        assert_eq!(running.status(), TaskStatus::Canceled);
        assert_eq!(task.close_count(), 1);

        let terminal = reporter.terminal_reports();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0]["status"], "CANCELED");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_lento_cae_al_estado_observado() {
        let mut config = test_config(1);
        config.cancel_wait = Duration::from_millis(100);
        let (executor, _) = executor_with(config);

        let task = Arc::new(ScriptedTask::new().slow_stop(Duration::from_millis(500)));
        let running = submit(&executor, 1, Arc::clone(&task));
        wait_until(|| task.status() == TaskStatus::Running).await;

        // la tarea termina sola mientras stop sigue dormido
        let finisher = Arc::clone(&task);
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(30)).await;
            finisher.release();
        });

        assert!(executor.cancel(JobIdentity::new(1)).await);
        running.wait_finished().await;
        assert_eq!(running.status(), TaskStatus::Done);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tarea_que_ignora_stop_sigue_viva_y_se_reporta_despues() {
        let mut config = test_config(1);
        config.cancel_wait = Duration::from_millis(100);
        let (executor, reporter) = executor_with(config);

        let task = Arc::new(ScriptedTask::new().ignoring_stop());
        let running = submit(&executor, 1, Arc::clone(&task));
        wait_until(|| task.status() == TaskStatus::Running).await;

        assert!(!executor.cancel(JobIdentity::new(1)).await);
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(executor.get_task(JobIdentity::new(1)).is_some());

        task.release();
        running.wait_finished().await;
        let terminal = reporter.terminal_reports();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0]["status"], "DONE");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panico_termina_en_failed_con_mensaje() {
        let (executor, reporter) = executor_with(test_config(1));
        let task = Arc::new(ScriptedTask::with_behavior(StartBehavior::Panic));
        let running = submit(&executor, 1, Arc::clone(&task));

        running.wait_finished().await;
        assert_eq!(running.status(), TaskStatus::Failed);
        assert_eq!(task.close_count(), 1);

        let terminal = reporter.terminal_reports();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0]["status"], "FAILED");
        assert!(terminal[0]["error_message"].as_str().unwrap().contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_false_sin_terminal_es_failed() {
        let (executor, _) = executor_with(test_config(1));
        let task = Arc::new(ScriptedTask::with_behavior(StartBehavior::ReturnFalse));
        let running = submit(&executor, 1, task);

        running.wait_finished().await;
        assert_eq!(running.status(), TaskStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn entrada_se_borra_tras_la_retencion() {
        let mut config = test_config(1);
        config.task_retention = Some(Duration::from_millis(50));
        let (executor, reporter) = executor_with(config);
        let task = Arc::new(ScriptedTask::with_behavior(StartBehavior::Finish(
            TaskStatus::Done,
        )));
        let running = submit(&executor, 1, task);

        running.wait_finished().await;
        assert!(running.monitor().is_final_reported());
        wait_until(|| executor.get_task(JobIdentity::new(1)).is_none()).await;
        assert!(executor.is_empty());
        assert_eq!(reporter.terminal_reports().len(), 1);
        assert!(reporter.calls(ReportEndpoint::TaskResultUpload) >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_cancela_lo_vivo_y_falla_lo_encolado() {
        let (executor, reporter) = executor_with(test_config(1));
        let first = Arc::new(ScriptedTask::new());
        let queued = Arc::new(ScriptedTask::new());
        let a = submit(&executor, 1, Arc::clone(&first));
        let b = submit(&executor, 2, Arc::clone(&queued));
        wait_until(|| first.status() == TaskStatus::Running).await;

        executor.shutdown().await;
        a.wait_finished().await;
        b.wait_finished().await;

        assert_eq!(a.status(), TaskStatus::Canceled);
        assert!(b.status().is_terminal());
        assert_eq!(queued.starts.load(Ordering::SeqCst), 0);
        assert_eq!(first.close_count(), 1);
        assert_eq!(queued.close_count(), 1);
        assert_eq!(reporter.terminal_reports().len(), 2);
    }
}
