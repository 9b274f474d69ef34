//! docflow command-line front end.
//!
//! Submits files to the pipeline, reports batch progress and runs the
//! distributed worker.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use docflow_core::{BatchStatus, JobSpec, JobStatus, PipelineEvent, ProgressSnapshot, Strategy};
use docflow_db::{Database, PoolConfig};
use docflow_inference::OllamaBackend;
use docflow_jobs::{
    collect_files, snapshot_from_repository, DistributedWorker, EngineBuilder, EngineConfig,
    PipelineEngine, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "docflow", version, about = "Document ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a file or directory and wait for it to be processed.
    Submit(SubmitArgs),
    /// Show the progress of a batch (requires DATABASE_URL).
    Status {
        batch_id: Uuid,
        /// Keep polling until the batch completes.
        #[arg(long)]
        watch: bool,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Consume the durable task queue until Ctrl-C (requires DATABASE_URL).
    Worker,
}

#[derive(Args)]
struct SubmitArgs {
    path: PathBuf,
    /// Descend into subdirectories.
    #[arg(long)]
    recursive: bool,
    /// Files per batch; all batches share one correlation id.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
    /// Overrides DOCFLOW_STRATEGY.
    #[arg(long)]
    strategy: Option<Strategy>,
    #[arg(long)]
    correlation_id: Option<String>,
    /// Reprocess files that already succeeded in an earlier batch.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    no_embed: bool,
    /// Return after enqueueing (distributed strategy only).
    #[arg(long)]
    no_wait: bool,
}

/// How a command finished when it did not error.
enum Outcome {
    Clean,
    HadFailures,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Submit(args) => submit(args).await,
        Command::Status {
            batch_id,
            watch,
            interval_ms,
        } => status(batch_id, watch, Duration::from_millis(interval_ms)).await,
        Command::Worker => worker().await,
    };

    match result {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::HadFailures) => ExitCode::from(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter (default: "docflow=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "docflow_cli=info,docflow_jobs=info,docflow_db=warn,docflow_inference=warn".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let Some(path) = log_file.as_deref() else {
        // Console output goes to stderr so progress lines stay clean on stdout.
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        return None;
    };

    let path = std::path::Path::new(path);
    let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("docflow.log");
    let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    if log_format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking),
            )
            .init();
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(log_ansi.unwrap_or(false));
        registry.with(layer).init();
    }
    Some(guard)
}

/// Connect to PostgreSQL when `DATABASE_URL` is set, sized for `jobs`
/// concurrent pipeline runs.
async fn connect_database(jobs: usize) -> anyhow::Result<Option<Database>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return Ok(None);
    };
    let pool_config = PoolConfig::for_workers(jobs).with_env_overrides();
    let db = Database::connect_with_config(&url, pool_config)
        .await
        .context("failed to connect to DATABASE_URL")?;
    db.migrate().await.context("failed to run migrations")?;
    info!("Connected to database");
    Ok(Some(db))
}

async fn require_database(jobs: usize) -> anyhow::Result<Database> {
    match connect_database(jobs).await? {
        Some(db) => Ok(db),
        None => bail!("DATABASE_URL must be set for this command"),
    }
}

/// Engine builder wired to Ollama and, if available, PostgreSQL.
fn engine_builder(config: EngineConfig, db: Option<&Database>) -> anyhow::Result<EngineBuilder> {
    let ollama = Arc::new(OllamaBackend::from_env().context("failed to configure Ollama")?);
    let mut builder = PipelineEngine::builder(config)
        .with_classifier(ollama.clone())
        .with_embedder(ollama);
    if let Some(db) = db {
        builder = builder
            .with_jobs(Arc::new(db.jobs.clone()))
            .with_store(Arc::new(db.documents.clone()))
            .with_queue(Arc::new(db.queue.clone()));
    }
    Ok(builder)
}

// =============================================================================
// submit
// =============================================================================

async fn submit(args: SubmitArgs) -> anyhow::Result<Outcome> {
    let mut config = EngineConfig::from_env()?;
    if let Some(strategy) = args.strategy {
        config = config.with_strategy(strategy);
    }
    if args.no_embed {
        config = config.with_embed(false);
    }
    let poll_interval = config.poll_interval;

    let files = collect_files(&args.path, args.recursive)?;
    if files.is_empty() {
        bail!("no files found under {}", args.path.display());
    }
    let correlation_id = args
        .correlation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let concurrency = match config.strategy {
        Strategy::Pool => config.resolved_workers(),
        Strategy::Async => config.max_concurrent,
        Strategy::Distributed => 1,
    };
    let db = connect_database(concurrency).await?;
    let engine = engine_builder(config, db.as_ref())?.build().await?;
    let strategy = engine.strategy();

    // Subscribe before submitting so no transition is missed.
    let printer = (strategy != Strategy::Distributed).then(|| spawn_event_printer(&engine));

    let mut batches = Vec::new();
    for chunk in files.chunks(args.batch_size.max(1)) {
        let specs = chunk
            .iter()
            .map(|path| JobSpec::file(path).with_force(args.force))
            .collect();
        let handle = engine
            .submit_batch(specs, Some(correlation_id.clone()))
            .await?;
        println!(
            "batch {} submitted: {} jobs ({} skipped as duplicates)",
            handle.batch_id,
            handle.job_ids.len(),
            handle.skipped
        );
        batches.push(handle.batch_id);
    }

    if strategy == Strategy::Distributed && args.no_wait {
        println!("correlation id {correlation_id}: jobs enqueued, not waiting");
        engine.shutdown().await?;
        return Ok(Outcome::Clean);
    }

    for batch_id in batches {
        watch_until_settled(&engine, batch_id, poll_interval).await?;
    }
    let summary = engine.progress_by_correlation(&correlation_id).await?;
    engine.shutdown().await?;
    if let Some(printer) = printer {
        printer.abort();
    }

    let Some(summary) = summary else {
        bail!("no batches tracked for correlation id {correlation_id}");
    };
    println!(
        "done [{correlation_id}]: {} batches, {} total, {} succeeded, {} failed, {} skipped, \
         {} pending",
        summary.batch_ids.len(),
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.pending
    );

    Ok(if summary.failed > 0 {
        Outcome::HadFailures
    } else {
        Outcome::Clean
    })
}

/// Print a progress line every poll until the batch settles.
async fn watch_until_settled(
    engine: &PipelineEngine,
    batch_id: Uuid,
    interval: Duration,
) -> anyhow::Result<ProgressSnapshot> {
    let wait = engine.wait_for_batch(batch_id);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(250)));
    loop {
        tokio::select! {
            snapshot = &mut wait => {
                let snapshot = snapshot?;
                print_progress(&snapshot);
                return Ok(snapshot);
            }
            _ = ticker.tick() => {
                match engine.progress(batch_id).await {
                    Ok(snapshot) => print_progress(&snapshot),
                    Err(e) => warn!(batch_id = %batch_id, error = %e, "Progress unavailable"),
                }
            }
        }
    }
}

fn spawn_event_printer(engine: &PipelineEngine) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => match envelope.payload {
                    PipelineEvent::JobTransition {
                        job_id,
                        to,
                        attempt,
                        error,
                        ..
                    } if to.is_terminal() || to == JobStatus::Retrying => match error {
                        Some(e) => println!("  job {job_id} -> {to} (attempt {attempt}): {e}"),
                        None => println!("  job {job_id} -> {to} (attempt {attempt})"),
                    },
                    PipelineEvent::BatchCompleted { snapshot } => {
                        println!("batch {} completed", snapshot.batch_id);
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(n)) => warn!(missed = n, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_progress(s: &ProgressSnapshot) {
    let eta = s
        .eta
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "batch {}: {}/{} done ({} ok, {} failed, {} skipped, {} running) {:.2}/s eta {}",
        s.batch_id,
        s.total - s.pending,
        s.total,
        s.succeeded,
        s.failed,
        s.skipped,
        s.running,
        s.throughput_per_sec,
        eta
    );
}

// =============================================================================
// status
// =============================================================================

async fn status(batch_id: Uuid, watch: bool, interval: Duration) -> anyhow::Result<Outcome> {
    let db = require_database(1).await?;
    let window = EngineConfig::from_env()?.throughput_window;

    loop {
        let snapshot = snapshot_from_repository(&db.jobs, batch_id, window).await?;
        print_progress(&snapshot);
        if !watch || snapshot.status == BatchStatus::Completed {
            return Ok(if snapshot.has_failures() {
                Outcome::HadFailures
            } else {
                Outcome::Clean
            });
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// worker
// =============================================================================

async fn worker() -> anyhow::Result<Outcome> {
    let worker_config = WorkerConfig::from_env();
    if !worker_config.enabled {
        warn!("Worker disabled via JOB_WORKER_ENABLED");
        return Ok(Outcome::Clean);
    }
    let db = require_database(worker_config.max_concurrent_jobs).await?;

    let runner = engine_builder(EngineConfig::from_env()?, Some(&db))?.into_runner()?;
    let handle = DistributedWorker::new(Arc::new(db.queue.clone()), runner, worker_config).start();
    info!("Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down worker");
    handle.shutdown().await?;
    Ok(Outcome::Clean)
}
