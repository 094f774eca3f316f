mod output;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use assess_core::config::OrchestratorConfig;
use assess_core::execution::TokioProcessExecutor;
use assess_core::logging::init_tracing;
use assess_core::models::{CoreError, CoreErrorKind, ProviderName, RunId, RunStatus, SubjectRef};
use assess_core::orchestration::{RunCoordinator, WorkerPool};
use assess_core::persistence::{InMemoryStatusStore, StatusStore};
use assess_core::sqlite::SqliteStatusStore;
use clap::{Parser, Subcommand};

use crate::output::{ProviderListing, StatusView, print_json};

#[derive(Parser)]
#[command(name = "assess")]
#[command(about = "Fan an assessment subject out to providers and report the run", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a run for SUBJECT and wait for it to finish
    Run {
        subject: String,

        /// Orchestrator config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// SQLite status database; runs are kept in memory without it
        #[arg(long)]
        database: Option<PathBuf>,

        /// Restrict the run to these providers (repeatable)
        #[arg(long = "provider")]
        providers: Vec<String>,

        /// Seconds to wait before cancelling the run
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// List the providers a config wires up
    Providers {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a stored run
    Status {
        run_id: u64,

        #[arg(long)]
        database: PathBuf,
    },
}

fn main() -> ExitCode {
    init_tracing("warn");
    let cli = Cli::parse();

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("assess: {error}");
            exit_code(&error)
        }
    }
}

fn execute(command: Command) -> Result<(), CoreError> {
    match command {
        Command::Run {
            subject,
            config,
            database,
            providers,
            wait_secs,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|error| {
                    CoreError::new(
                        CoreErrorKind::Internal,
                        format!("failed to start tokio runtime: {error}"),
                    )
                })?;
            runtime.block_on(run_subject(
                SubjectRef::new(subject),
                config.as_deref(),
                database.as_deref(),
                providers,
                Duration::from_secs(wait_secs),
            ))
        }
        Command::Providers { config } => list_providers(config.as_deref()),
        Command::Status { run_id, database } => show_status(RunId(run_id), &database),
    }
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, CoreError> {
    match path {
        Some(path) => OrchestratorConfig::load(path),
        None => Ok(OrchestratorConfig::default()),
    }
}

fn open_sqlite(path: &Path) -> Result<SqliteStatusStore, CoreError> {
    let store = SqliteStatusStore::new(path);
    store.migrate_to_latest()?;
    Ok(store)
}

async fn run_subject(
    subject: SubjectRef,
    config_path: Option<&Path>,
    database: Option<&Path>,
    providers: Vec<String>,
    wait: Duration,
) -> Result<(), CoreError> {
    let config = load_config(config_path)?;
    let registry = config.build_registry(Arc::new(TokioProcessExecutor), Vec::new())?;
    let store: Arc<dyn StatusStore> = match database {
        Some(path) => Arc::new(open_sqlite(path)?),
        None => Arc::new(InMemoryStatusStore::new()),
    };
    let pool = WorkerPool::start(config.pool_config())?;
    let coordinator =
        RunCoordinator::new(registry, pool.clone(), store, config.coordinator_config())?;

    let run = if providers.is_empty() {
        coordinator.submit(subject).await?
    } else {
        let names: Vec<ProviderName> = providers.into_iter().map(ProviderName::from).collect();
        coordinator.submit_with_providers(subject, &names).await?
    };
    tracing::info!(run_id = %run, "run submitted");

    match coordinator.wait_for_completion(run, wait).await {
        Ok(status) => {
            print_json(&StatusView::from_status(&status)?)?;
            pool.shutdown(true).await;
            Ok(())
        }
        Err(error) if error.kind == CoreErrorKind::Timeout => {
            coordinator.cancel(run).await?;
            let status = coordinator.get_status(run).await?;
            print_json(&StatusView::from_status(&status)?)?;
            pool.shutdown(false).await;
            Err(error)
        }
        Err(error) => {
            pool.shutdown(false).await;
            Err(error)
        }
    }
}

fn list_providers(config_path: Option<&Path>) -> Result<(), CoreError> {
    let config = load_config(config_path)?;
    let listing: Vec<ProviderListing> = config
        .providers
        .keys()
        .map(|name| ProviderListing::new(name, &config.profile_for(name, Default::default())))
        .collect();
    print_json(&listing)
}

fn show_status(run: RunId, database: &Path) -> Result<(), CoreError> {
    let store = open_sqlite(database)?;
    let record = store.get_run(run)?.ok_or_else(|| {
        CoreError::new(CoreErrorKind::UnknownRun, format!("run {run} is not stored")).for_run(run)
    })?;
    let tasks = store.list_tasks(run)?;
    print_json(&StatusView::from_status(&RunStatus::new(record, tasks))?)
}

fn exit_code(error: &CoreError) -> ExitCode {
    match error.kind {
        CoreErrorKind::InvalidInput | CoreErrorKind::MalformedInput => ExitCode::from(2),
        CoreErrorKind::UnknownRun => ExitCode::from(3),
        CoreErrorKind::Timeout => ExitCode::from(4),
        _ => ExitCode::FAILURE,
    }
}
