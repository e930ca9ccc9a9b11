/*
 * ACE over HOLOFS: batch refinement CLI
 *
 * Mounts a directory of raw transcripts, queues every file, runs the worker
 * pool until the queue drains, and prints the dashboard snapshot as JSON.
 *
 * Usage:
 *   ace-holofs run --source ./calls
 *   ace-holofs run --source ./calls --context ./answers --config ace.yaml --workers 8
 *   ace-holofs check-config ace.yaml
 *
 * Logging goes to stderr; RUST_LOG overrides the default filter.
 */

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ace_orchestration::{drain, AceConfig, AceOrchestrator, StageId, WorkerPool};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use holofs_store::{ArtifactStore, DirectorySource, InMemoryArtifactStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SOURCE_ID: &str = "calls";
const CONTEXT_SOURCE_ID: &str = "context";

#[derive(Parser, Debug)]
#[command(name = "ace-holofs", version, about = "Refine call transcripts over a versioned store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refine every file under a directory
    Run {
        /// Directory of raw transcripts, mounted read-only
        #[arg(long)]
        source: PathBuf,

        /// Directory of clarification answers (one file per marker kind)
        #[arg(long)]
        context: Option<PathBuf>,

        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker count (overrides the config)
        #[arg(long)]
        workers: Option<usize>,

        /// Comma-separated stage subset, e.g. `formatting,summary`
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Give up waiting for the queue to drain after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,

        /// Write finished session records here (bincode)
        #[arg(long)]
        export_history: Option<PathBuf>,
    },

    /// Validate a configuration file and print it with defaults filled in
    CheckConfig {
        path: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ace_orchestration=info,holofs_store=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AceConfig> {
    match path {
        Some(path) => AceConfig::from_yaml(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(AceConfig::default()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    source: PathBuf,
    context: Option<PathBuf>,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    stages: Vec<String>,
    timeout_secs: u64,
    export_history: Option<PathBuf>,
) -> anyhow::Result<bool> {
    let mut config = load_config(config_path.as_ref())?;
    if let Some(count) = workers {
        config.workers.count = count;
        config.validate()?;
    }
    let stages = stages
        .iter()
        .map(|s| StageId::from_str(s.trim()))
        .collect::<Result<Vec<_>, _>>()?;

    if !source.is_dir() {
        bail!("source {} is not a directory", source.display());
    }

    let store = Arc::new(InMemoryArtifactStore::new(config.store.store_config()));
    let source_root = format!("/mnt/{}", SOURCE_ID);
    store
        .mount(
            SOURCE_ID,
            &source_root,
            Arc::new(DirectorySource::new(SOURCE_ID, &source)),
        )
        .await?;
    if let Some(context) = context {
        store
            .mount(
                CONTEXT_SOURCE_ID,
                &config.refinement.context_root,
                Arc::new(DirectorySource::new(CONTEXT_SOURCE_ID, context)),
            )
            .await?;
    }

    let config = Arc::new(config);
    let store: Arc<dyn ArtifactStore> = store;
    let orchestrator = Arc::new(AceOrchestrator::new(Arc::clone(&config), Arc::clone(&store)));

    let files = store.walk_files(&source_root).await?;
    let mut submitted = 0usize;
    for path in &files {
        // Untrusted content is rejected here, before anything is queued
        if let Err(e) = store.materialize(path.as_str()).await {
            warn!(path = %path, error = %e, "Not imported");
            continue;
        }
        match orchestrator.submit(path.as_str(), &stages, 0).await {
            Ok(entry_id) => {
                submitted += 1;
                info!(path = %path, entry_id = %entry_id, "Queued");
            }
            Err(e) => warn!(path = %path, error = %e, "Skipped"),
        }
    }
    info!(files = files.len(), submitted, workers = config.workers.count, "Starting refinement");

    let pool = WorkerPool::spawn(Arc::clone(&orchestrator), config.workers.count);
    let drained = drain(
        &orchestrator,
        Duration::from_millis(50),
        Duration::from_secs(timeout_secs),
    )
    .await;
    if !drained {
        warn!(timeout_secs, "Queue did not drain in time");
    }
    let stats = pool.shutdown().await;

    let snapshot = orchestrator.dashboard().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let records = orchestrator.history().list();
    let failed = records
        .iter()
        .filter(|r| r.status == ace_orchestration::SessionStatus::Failed)
        .count();
    info!(
        sessions = records.len(),
        failed,
        dead_letters = orchestrator.dead_letters().len(),
        worker_sessions = stats.iter().map(|s| s.sessions_run()).sum::<usize>(),
        "Refinement finished"
    );

    if let Some(out) = export_history {
        let bytes = orchestrator.history().export_bincode()?;
        std::fs::write(&out, bytes)
            .with_context(|| format!("writing history to {}", out.display()))?;
        info!(path = %out.display(), records = records.len(), "History exported");
    }

    Ok(drained && failed == 0)
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    match AceConfig::from_yaml(&path) {
        Ok(config) => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
        Err(e) => {
            if let Some(field) = e.field() {
                warn!(field, "Rejected setting");
            }
            Err(e).with_context(|| format!("checking config {}", path.display()))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            source,
            context,
            config,
            workers,
            stages,
            timeout_secs,
            export_history,
        } => {
            run(
                source,
                context,
                config,
                workers,
                stages,
                timeout_secs,
                export_history,
            )
            .await
        }
        Command::CheckConfig { path } => check_config(path).map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
