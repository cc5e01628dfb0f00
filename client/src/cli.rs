use std::{collections::HashMap, fs};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::job::PARAM_SQL_CONTENT;
use common::{urls, ApiResponse, JobIdentity, SubmitJobRequest, TaskResult};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con el plano de control de un executor")]
struct Cli {
    /// URL base del executor
    #[arg(long, env = "EXECUTOR_URL", default_value = "http://localhost:8990")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job nuevo
    Submit {
        #[arg(value_name = "JOB_ID")]
        id: u64,

        /// Tipo de tarea (SQL_PLAN, SLEEP...)
        #[arg(long, default_value = "SQL_PLAN")]
        kind: String,

        /// Parámetro clave=valor, se puede repetir
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Archivo con el script SQL (se manda como sqlContent)
        #[arg(long)]
        sql_file: Option<String>,
    },
    /// Pide la cancelación de un job
    Stop {
        #[arg(value_name = "JOB_ID")]
        id: u64,
    },
    /// Cambia parámetros de un job en curso
    Modify {
        #[arg(value_name = "JOB_ID")]
        id: u64,

        #[arg(long = "param", value_parser = parse_key_val, required = true)]
        params: Vec<(String, String)>,
    },
    /// Muestra el log de un job
    Log {
        #[arg(value_name = "JOB_ID")]
        id: u64,

        /// ALL o WARN
        #[arg(long = "type", default_value = "ALL")]
        log_type: String,

        #[arg(long)]
        max_lines: Option<usize>,

        #[arg(long)]
        max_bytes: Option<usize>,
    },
    /// Consulta el resultado actual de un job
    Result {
        #[arg(value_name = "JOB_ID")]
        id: u64,
    },
    /// Chequea que el executor esté vivo
    Health,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("se esperaba clave=valor, llegó {:?}", raw)),
    }
}

/// Manda la petición y desarma el sobre; un error del executor corta acá.
async fn call(req: RequestBuilder) -> Result<Value> {
    let resp = req.send().await.context("no se pudo hablar con el executor")?;
    let status = resp.status();
    let envelope: ApiResponse = resp
        .json()
        .await
        .with_context(|| format!("respuesta inesperada (status {})", status))?;

    match envelope.error {
        Some(err) => bail!("{:?}: {}", err.code, err.message),
        None => Ok(envelope.data.unwrap_or(Value::Null)),
    }
}

fn print_result(result: &TaskResult) {
    println!("Job {}:", result.job_identity);
    println!("  estado: {}", result.status);
    println!("  progreso: {:.1}%", result.progress);
    println!("  executor: {}", result.executor_endpoint);
    if let Some(ref error) = result.error_message {
        println!("  error: {}", error);
    }
    if !result.result.is_null() {
        println!("  resultado: {}", result.result);
    }
    if let Some(ref metadata) = result.log_metadata {
        println!("  logs:");
        for (key, value) in metadata {
            println!("    - {} = {}", key, value);
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            id,
            kind,
            params,
            sql_file,
        } => {
            let mut parameters: HashMap<String, String> = params.into_iter().collect();
            if let Some(path) = sql_file {
                let script = fs::read_to_string(&path)
                    .with_context(|| format!("leyendo el script {}", path))?;
                parameters.insert(PARAM_SQL_CONTENT.to_string(), script);
            }

            let req = SubmitJobRequest {
                job_identity: JobIdentity::new(id),
                task_kind: kind,
                parameters,
            };
            let url = format!("{}{}", base_url, urls::SUBMIT_JOB);
            call(client.post(&url).json(&req)).await?;
            println!("Job {} aceptado (tipo {})", req.job_identity, req.task_kind);
        }

        Commands::Stop { id } => {
            let url = format!("{}{}", base_url, urls::job_path(urls::STOP_TASK, id.into()));
            let stopped = call(client.post(&url)).await?;
            if stopped == Value::Bool(true) {
                println!("Job {} cancelado", id);
            } else {
                println!("Job {} sigue corriendo: el stop no se confirmó a tiempo", id);
            }
        }

        Commands::Modify { id, params } => {
            let parameters: HashMap<String, String> = params.into_iter().collect();
            let url = format!(
                "{}{}",
                base_url,
                urls::job_path(urls::MODIFY_PARAMETERS, id.into())
            );
            let applied = call(client.post(&url).json(&parameters)).await?;
            println!("modify aplicado: {}", applied);
        }

        Commands::Log {
            id,
            log_type,
            max_lines,
            max_bytes,
        } => {
            let url = format!("{}{}", base_url, urls::job_path(urls::QUERY_LOG, id.into()));
            let mut query = vec![(urls::QUERY_LOG_TYPE, log_type)];
            if let Some(lines) = max_lines {
                query.push((urls::QUERY_FETCH_MAX_LINE, lines.to_string()));
            }
            if let Some(bytes) = max_bytes {
                query.push((urls::QUERY_FETCH_MAX_BYTE_SIZE, bytes.to_string()));
            }
            let text = call(client.get(&url).query(&query)).await?;
            print!("{}", text.as_str().unwrap_or_default());
        }

        Commands::Result { id } => {
            let url = format!("{}{}", base_url, urls::job_path(urls::GET_RESULT, id.into()));
            let data = call(client.get(&url)).await?;
            let result: TaskResult =
                serde_json::from_value(data).context("resultado con formato inesperado")?;
            print_result(&result);
        }

        Commands::Health => {
            let url = format!("{}{}", base_url, urls::HEALTH);
            let resp = client.get(&url).send().await?;
            println!("{} ({})", resp.text().await?, url);
        }
    }

    Ok(())
}
