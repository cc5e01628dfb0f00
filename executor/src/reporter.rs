use std::time::Duration;

use async_trait::async_trait;
use common::{urls, ApiResponse};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ExecutorError, Result};

/// Endpoints del coordinador que reciben reportes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportEndpoint {
    TaskResultUpload,
    TaskHeart,
}

impl ReportEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            ReportEndpoint::TaskResultUpload => urls::TASK_RESULT_UPLOAD,
            ReportEndpoint::TaskHeart => urls::TASK_HEART,
        }
    }
}

/// Canal de salida hacia el coordinador.
///
/// `Ok(true)` = el coordinador confirmó, `Ok(false)` = respondió sin
/// confirmar, `Err` = no se pudo entregar.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report(&self, endpoint: ReportEndpoint, payload: Value) -> Result<bool>;
}

/// Reporter HTTP: prueba las URLs del coordinador en orden hasta que una confirme.
#[derive(Debug, Clone)]
pub struct HttpTaskReporter {
    client: Client,
    coordinator_urls: Vec<String>,
}

impl HttpTaskReporter {
    pub fn new(coordinator_urls: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            coordinator_urls: coordinator_urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<ApiResponse> {
        let resp = self.client.post(url).json(payload).send().await?;
        if !resp.status().is_success() {
            return Err(ExecutorError::Internal(format!(
                "el coordinador devolvió status {}",
                resp.status()
            )));
        }
        Ok(resp.json::<ApiResponse>().await?)
    }
}

#[async_trait]
impl TaskReporter for HttpTaskReporter {
    async fn report(&self, endpoint: ReportEndpoint, payload: Value) -> Result<bool> {
        if self.coordinator_urls.is_empty() {
            return Err(ExecutorError::Config(
                "no hay URLs de coordinador configuradas".to_string(),
            ));
        }

        let mut answered = false;
        let mut last_error = None;

        for base in &self.coordinator_urls {
            let url = format!("{}{}", base, endpoint.path());
            match self.post(&url, &payload).await {
                Ok(resp) if resp.is_ack() => {
                    debug!("reporte {:?} confirmado por {}", endpoint, base);
                    return Ok(true);
                }
                Ok(resp) => {
                    warn!("{} no confirmó el reporte {:?}: {:?}", base, endpoint, resp.error);
                    answered = true;
                }
                Err(e) => {
                    warn!("error reportando {:?} a {}: {}", endpoint, base, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Coordinador de mentira en un puerto efímero. Responde `ack` y cuenta
    /// las llamadas recibidas.
    async fn fake_coordinator(ack: bool) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            urls::TASK_RESULT_UPLOAD,
            post(move |Json(_body): Json<Value>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(ApiResponse::ok(json!(ack)))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    /// Puerto donde no escucha nadie.
    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    fn reporter(urls: Vec<String>) -> HttpTaskReporter {
        HttpTaskReporter::new(urls, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn salta_al_siguiente_coordinador_si_uno_cae() {
        let (alive, hits) = fake_coordinator(true).await;
        let r = reporter(vec![dead_url().await, alive]);

        let acked = r
            .report(ReportEndpoint::TaskResultUpload, json!({"x": 1}))
            .await
            .unwrap();
        assert!(acked);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respuesta_sin_confirmar_es_false() {
        let (url, _) = fake_coordinator(false).await;
        let acked = reporter(vec![url])
            .report(ReportEndpoint::TaskResultUpload, json!({}))
            .await
            .unwrap();
        assert!(!acked);
    }

    #[tokio::test]
    async fn todos_caidos_es_error() {
        let r = reporter(vec![dead_url().await]);
        assert!(r.report(ReportEndpoint::TaskHeart, json!({})).await.is_err());
        assert!(reporter(Vec::new())
            .report(ReportEndpoint::TaskHeart, json!({}))
            .await
            .is_err());
    }
}
