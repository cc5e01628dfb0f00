use std::sync::Arc;

use anyhow::{Context, Result};
use common::job::{TASK_KIND_SLEEP, TASK_KIND_SQL_PLAN};
use executor::{
    logs::{init_tracing, FileLogStore},
    reporter::HttpTaskReporter,
    server::{self, AppState},
    storage::{LocalObjectStorage, ObjectStorage},
    tasks::{
        sleep::SleepTask,
        sql_plan::{DryRunConnector, SqlConnector, SqlPlanTask},
    },
    Executor, ExecutorConfig, TaskFactory,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ExecutorConfig::from_env().context("leyendo la configuración")?;
    init_tracing(&config.log_dir)?;

    if !config.report_enabled() {
        warn!("COORDINATOR_URLS vacío: los resultados sólo se entregan por pull");
    }

    let storage: Option<Arc<dyn ObjectStorage>> = match &config.storage_dir {
        Some(dir) => {
            let storage = LocalObjectStorage::new(dir)
                .with_context(|| format!("abriendo el storage en {}", dir.display()))?;
            info!("object storage local en {}", dir.display());
            let storage: Arc<dyn ObjectStorage> = Arc::new(storage);
            Some(storage)
        }
        None => None,
    };

    let reporter = HttpTaskReporter::new(
        config.coordinator_urls.clone(),
        config.report_http_timeout,
    )?;
    let log_store = FileLogStore::new(&config.log_dir);
    let port = config.port;

    info!(
        "executor {} con pool={} coordinadores={:?}",
        config.executor_endpoint, config.pool_size, config.coordinator_urls
    );

    let executor = Arc::new(
        Executor::new(config, Arc::new(reporter), Arc::new(log_store))
            .with_shared_storage(storage),
    );

    let connector: Arc<dyn SqlConnector> = Arc::new(DryRunConnector);
    let mut factory = TaskFactory::new();
    factory
        .register(TASK_KIND_SQL_PLAN, move || {
            Arc::new(SqlPlanTask::new(Arc::clone(&connector)))
        })
        .register(TASK_KIND_SLEEP, || Arc::new(SleepTask::new()));
    info!("tipos de tarea: {:?}", factory.kinds());

    server::serve(AppState::new(executor, factory), port).await?;
    info!("executor detenido");
    Ok(())
}
