mod config;
mod engine;
mod error;
mod evaluator;
mod executor;
mod invoker;
mod reaper;
mod runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::LanguageConfigManager;
use error::EvalError;
use executor::Proctor;
use proctor_common::config::EngineConfig;
use proctor_common::registry::{Lookup, TestCaseRegistry};
use proctor_common::types::EvaluationRequest;
use runner::RunnerSet;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[derive(Parser)]
#[command(name = "proctor-worker")]
#[command(about = "Proctor - run untrusted submissions in a sandbox and score them against test cases", long_about = None)]
struct Cli {
    /// Directory holding languages.json and questions.json
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a single submission and print the result envelope
    Evaluate {
        /// Language name (e.g., python)
        #[arg(short, long)]
        language: String,

        /// Question id (0 = syntax check only)
        #[arg(short, long)]
        question: u32,

        /// Source file; read from stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Read JSON requests line by line from stdin, answer on stdout
    Serve,

    /// List registered questions
    Questions,
}

/// One `serve` input line
#[derive(Debug, Deserialize)]
struct ServeRequest {
    #[serde(default)]
    request_id: Option<Value>,
    #[serde(flatten)]
    request: EvaluationRequest,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Questions => {
            let registry = TestCaseRegistry::load_or_builtin(&cli.config_dir)?;
            list_questions(&registry);
        }
        Commands::Evaluate {
            language,
            question,
            file,
        } => {
            let proctor = build_proctor(&cli.config_dir)?;
            let source = read_source(file.as_deref()).await?;
            let request = EvaluationRequest {
                language,
                source,
                question_id: question,
            };

            match proctor.evaluate(&request).await {
                Ok(report) => {
                    println!("{}", serde_json::to_string_pretty(&report.envelope())?);
                }
                Err(e) => {
                    error!(error = %e, "Evaluation rejected");
                    println!("{}", error_line(None, e.kind(), &e.to_string()));
                    std::process::exit(1);
                }
            }
        }
        Commands::Serve => {
            let proctor = Arc::new(build_proctor(&cli.config_dir)?);
            serve(proctor).await?;
            // The stdin reader may still be parked on a blocking read
            std::process::exit(0);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let json = std::env::var("PROCTOR_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_proctor(config_dir: &Path) -> Result<Proctor> {
    info!(config_dir = %config_dir.display(), "Proctor worker booting...");

    let config_manager = LanguageConfigManager::load_or_builtin(config_dir).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    let registry = TestCaseRegistry::load_or_builtin(config_dir)?;
    let engine_config = EngineConfig::from_env();

    let runners = RunnerSet::from_config(&config_manager);
    info!(
        languages = ?runners.languages(),
        questions = ?registry.question_ids(),
        timeout_ms = engine_config.timeout.as_millis() as u64,
        max_sandboxes = engine_config.max_concurrent_sandboxes,
        "Engine configured"
    );

    Ok(Proctor::new(Arc::new(registry), runners, engine_config))
}

async fn read_source(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read source file {}", path.display())),
        None => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("Failed to read source from stdin")?;
            Ok(source)
        }
    }
}

fn list_questions(registry: &TestCaseRegistry) {
    for id in registry.question_ids() {
        if let Lookup::Found(set) = registry.lookup(id) {
            println!("{}\t{}\t{} cases", id, set.function_name, set.cases.len());
        }
    }
}

fn error_line(request_id: Option<&Value>, kind: &str, message: &str) -> String {
    let mut line = json!({ "error": kind, "message": message });
    if let (Some(id), Value::Object(map)) = (request_id, &mut line) {
        map.insert("request_id".to_string(), id.clone());
    }
    line.to_string()
}

fn report_line(request_id: Option<&Value>, result: Result<Option<Value>, EvalError>) -> String {
    match result {
        Ok(Some(mut envelope)) => {
            if let (Some(id), Value::Object(map)) = (request_id, &mut envelope) {
                map.insert("request_id".to_string(), id.clone());
            }
            envelope.to_string()
        }
        Ok(None) => error_line(request_id, "cancelled", "Evaluation cancelled by shutdown"),
        Err(e) => error_line(request_id, e.kind(), &e.to_string()),
    }
}

/// Resolves once shutdown is signalled; never resolves if the signal source is gone
async fn shutdown_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_task_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Evaluation task panicked");
    }
}

/// Collect tasks that have already finished without waiting on the rest
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = tasks.try_join_next() {
        log_task_exit(joined);
        reaped += 1;
    }
    reaped
}

/// Request loop: one JSON request per stdin line, one JSON response per stdout line.
///
/// Responses are written in completion order; callers correlate via `request_id`.
#[instrument(skip(proctor))]
async fn serve(proctor: Arc<Proctor>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, cancelling in-flight evaluations...");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(capacity = proctor.pool().capacity(), "Serving requests from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();

    loop {
        reap_finished(&mut tasks);
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read request line")?,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_task_exit(joined);
                continue;
            }
            _ = shutdown_requested(shutdown_rx.clone()) => break,
        };
        let Some(line) = line else {
            info!("Input closed, draining in-flight evaluations");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let parsed: ServeRequest = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Invalid request line");
                let _ = out_tx
                    .send(error_line(None, "invalid_request", &e.to_string()))
                    .await;
                continue;
            }
        };

        let proctor = Arc::clone(&proctor);
        let out_tx = out_tx.clone();
        let cancelled = shutdown_requested(shutdown_rx.clone());
        tasks.spawn(async move {
            let result = proctor
                .evaluate_until(&parsed.request, cancelled)
                .await
                .map(|report| report.map(|r| serde_json::to_value(r.envelope()).unwrap_or(Value::Null)));

            debug!(request_id = ?parsed.request_id, "Request finished");
            let _ = out_tx
                .send(report_line(parsed.request_id.as_ref(), result))
                .await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        log_task_exit(joined);
    }

    drop(out_tx);
    writer.await.context("Response writer task failed")??;

    info!(available = proctor.pool().available(), "Worker shutdown complete");
    Ok(())
}
