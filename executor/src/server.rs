use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::{Method, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use common::{urls, ApiResponse, ErrorCode, SubmitJobRequest};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{root_cause_message, Result};
use crate::executor::Executor;
use crate::factory::TaskFactory;
use crate::router::RequestRouter;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub factory: Arc<TaskFactory>,
    pub router: Arc<RequestRouter>,
}

impl AppState {
    pub fn new(executor: Arc<Executor>, factory: TaskFactory) -> Self {
        Self {
            router: Arc::new(RequestRouter::new(Arc::clone(&executor))),
            factory: Arc::new(factory),
            executor,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(urls::HEALTH, get(health))
        .route(urls::SUBMIT_JOB, post(submit_job))
        .fallback(control)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Levanta el servidor y, con Ctrl-C, apaga el executor antes de salir.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let executor = Arc::clone(&state.executor);
    let app = build_router(state);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("executor escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("no se pudo escuchar Ctrl-C: {}", e);
                return;
            }
            info!("Ctrl-C recibido, apagando executor...");
            executor.shutdown().await;
        })
        .await?;
    Ok(())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea la tarea con la factory y la pasa al executor
async fn submit_job(
    State(state): State<AppState>,
    body: String,
) -> (StatusCode, Json<ApiResponse>) {
    let resp = match accept_job(&state, &body) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("submit rechazado: {}", e);
            ApiResponse::error(e.code(), root_cause_message(&e))
        }
    };
    (status_for(&resp), Json(resp))
}

fn accept_job(state: &AppState, body: &str) -> Result<ApiResponse> {
    let req: SubmitJobRequest = serde_json::from_str(body)?;
    let task = state.factory.create(&req.task_kind)?;
    let context = state.executor.job_context(req.job_identity, req.parameters);
    state.executor.execute(task, context)?;

    info!("job {} aceptado (tipo {})", req.job_identity, req.task_kind);
    Ok(ApiResponse::ok(json!({ "job_identity": req.job_identity })))
}

// Todo lo que no es health/submit es plano de control
async fn control(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, Json<ApiResponse>) {
    let resp = state.router.process(&method, &uri, &body).await;
    (status_for(&resp), Json(resp))
}

fn status_for(resp: &ApiResponse) -> StatusCode {
    match resp.error_code() {
        None => StatusCode::OK,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::BadRequest) => StatusCode::BAD_REQUEST,
        Some(ErrorCode::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
