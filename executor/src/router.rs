use std::{collections::HashMap, sync::Arc};

use axum::http::{Method, Uri};
use common::{urls, ApiResponse, ErrorCode, JobIdentity};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{root_cause_message, ExecutorError, Result};
use crate::executor::{Executor, RunningTask};
use crate::logs::LogType;
use crate::result::build_task_result;

/// Operaciones del plano de control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    QueryLog,
    StopTask,
    GetResult,
    ModifyParameters,
}

struct Route {
    method: Method,
    prefix: &'static str,
    operation: Operation,
}

/// Despacha las peticiones de control (`/task/...`) contra el executor.
/// Cada ruta es `{prefijo}/{id numérico}`; la primera que matchea gana.
pub struct RequestRouter {
    executor: Arc<Executor>,
    routes: Vec<Route>,
}

impl RequestRouter {
    pub fn new(executor: Arc<Executor>) -> Self {
        let routes = vec![
            Route {
                method: Method::GET,
                prefix: urls::QUERY_LOG,
                operation: Operation::QueryLog,
            },
            Route {
                method: Method::POST,
                prefix: urls::STOP_TASK,
                operation: Operation::StopTask,
            },
            Route {
                method: Method::GET,
                prefix: urls::GET_RESULT,
                operation: Operation::GetResult,
            },
            Route {
                method: Method::POST,
                prefix: urls::MODIFY_PARAMETERS,
                operation: Operation::ModifyParameters,
            },
        ];
        Self { executor, routes }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Option<(Operation, JobIdentity)> {
        self.routes
            .iter()
            .filter(|route| route.method == *method)
            .find_map(|route| {
                let id = path.strip_prefix(route.prefix)?.strip_prefix('/')?;
                if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                id.parse().ok().map(|id| (route.operation, id))
            })
    }

    /// Nunca falla: todo error sale como sobre con su código.
    pub async fn process(&self, method: &Method, uri: &Uri, body: &str) -> ApiResponse {
        let Some((operation, id)) = self.resolve(method, uri.path()) else {
            debug!("sin ruta para {} {}", method, uri);
            return ApiResponse::error(
                ErrorCode::NotFound,
                format!("no hay ruta para {} {}", method, uri.path()),
            );
        };

        match self.dispatch(operation, id, uri.query(), body).await {
            Ok(data) => ApiResponse::ok(data),
            Err(e) => {
                warn!(job_id = %id, "{:?} falló: {}", operation, e);
                ApiResponse::error(e.code(), root_cause_message(&e))
            }
        }
    }

    async fn dispatch(
        &self,
        operation: Operation,
        id: JobIdentity,
        query: Option<&str>,
        body: &str,
    ) -> Result<Value> {
        match operation {
            Operation::QueryLog => self.query_log(id, query).await,
            Operation::StopTask => {
                self.running(id)?;
                Ok(json!(self.executor.cancel(id).await))
            }
            Operation::GetResult => {
                let running = self.running(id)?;
                let result = build_task_result(
                    running.container(),
                    &self.executor.config().executor_endpoint,
                    running.monitor().take_log_metadata(),
                );
                Ok(serde_json::to_value(result)?)
            }
            Operation::ModifyParameters => {
                let running = self.running(id)?;
                let parameters: HashMap<String, String> = serde_json::from_str(body)?;
                let task = Arc::clone(running.task());
                let applied = tokio::task::spawn_blocking(move || task.modify(&parameters))
                    .await
                    .map_err(|e| ExecutorError::Internal(e.to_string()))?;
                Ok(json!(applied))
            }
        }
    }

    fn running(&self, id: JobIdentity) -> Result<Arc<RunningTask>> {
        self.executor
            .get_task(id)
            .ok_or(ExecutorError::TaskNotFound(id))
    }

    async fn query_log(&self, id: JobIdentity, query: Option<&str>) -> Result<Value> {
        let params: HashMap<String, String> =
            url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
                .into_owned()
                .collect();

        let log_type = match params.get(urls::QUERY_LOG_TYPE) {
            Some(raw) => raw.parse()?,
            None => LogType::All,
        };
        let config = self.executor.config();
        let max_lines = parse_limit(
            &params,
            urls::QUERY_FETCH_MAX_LINE,
            config.log_fetch_max_lines,
        )?;
        let max_bytes = parse_limit(
            &params,
            urls::QUERY_FETCH_MAX_BYTE_SIZE,
            config.log_fetch_max_bytes,
        )?;

        let store = Arc::clone(self.executor.log_store());
        let text = tokio::task::spawn_blocking(move || {
            store.get_log(id, log_type, max_lines, max_bytes)
        })
        .await
        .map_err(|e| ExecutorError::Internal(e.to_string()))??;
        Ok(Value::String(text))
    }
}

fn parse_limit(params: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ExecutorError::BadRequest(format!("{} inválido: {}", key, raw))),
    }
}
