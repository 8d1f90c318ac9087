//! Database backup service
//!
//! Scheduled and on-demand PostgreSQL snapshots, uploaded to remote storage,
//! with every attempt recorded in an audit history.

// backupd/src/main.rs
mod api;
mod backup;
mod config;
mod errors;
mod history;
mod restore;
mod scheduler;
mod utils;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backup::{BackupOrchestrator, BackupOutcome, Initiator, OrchestratorDeps, PgDumpProducer, RunResult};
use config::{AppConfig, DEFAULT_CONFIG_PATH, HistoryConfig};
use errors::AppError;
use history::{HistoryRecorder, HistoryStore, MemoryHistoryStore, PgHistoryStore};
use restore::PgRestoreExecutor;
use scheduler::BackupScheduler;
use utils::shutdown::cancel_on_shutdown;

const HISTORY_PAGE: i64 = 20;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Backup { operator_id: Option<i64> },
    Restore { artifact: String },
    History,
}

fn parse_command(args: &[String]) -> errors::Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("backup") => {
            let operator_id = args
                .get(1)
                .map(|raw| {
                    raw.parse::<i64>()
                        .map_err(|_| AppError::InvalidInput(format!("operator id must be an integer, got '{}'", raw)))
                })
                .transpose()?;
            Ok(Command::Backup { operator_id })
        }
        Some("restore") => args
            .get(1)
            .map(|artifact| Command::Restore {
                artifact: artifact.clone(),
            })
            .ok_or_else(|| AppError::InvalidInput("usage: backupd restore <artifact_name>".to_string())),
        Some("history") => Ok(Command::History),
        Some(other) => Err(AppError::InvalidInput(format!(
            "unknown command '{}'; expected serve, backup, restore or history",
            other
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backupd=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run_app().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    let config_path = std::env::var("BACKUPD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;
    tracing::info!(config = %config_path.display(), "configuration loaded");

    let history = build_history_store(&app_config.history)
        .await
        .context("Failed to prepare history store")?;

    if command == Command::History {
        let records = history.list(HISTORY_PAGE, 0).await.context("Failed to read backup history")?;
        for record in records {
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());
    let orchestrator = Arc::new(build_orchestrator(&app_config, Arc::clone(&history), cancel.clone())?);

    match command {
        Command::Serve => {
            serve(app_config, orchestrator, history, cancel).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Backup { operator_id } => {
            let initiator = match operator_id {
                Some(operator_id) => Initiator::Manual { operator_id },
                None => Initiator::Automatic,
            };
            Ok(report(orchestrator.backup(initiator).await))
        }
        Command::Restore { artifact } => {
            let outcome = orchestrator.try_restore(&artifact, None).await?;
            Ok(report(outcome))
        }
        Command::History => Ok(ExitCode::SUCCESS),
    }
}

async fn build_history_store(config: &HistoryConfig) -> errors::Result<Arc<dyn HistoryStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgHistoryStore::connect(url).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("history.database_url not set; backup history is kept in memory only");
            Ok(Arc::new(MemoryHistoryStore::new()))
        }
    }
}

fn build_orchestrator(
    config: &AppConfig,
    history: Arc<dyn HistoryStore>,
    cancel: CancellationToken,
) -> Result<BackupOrchestrator> {
    let remote = backup::build_remote_store(&config.remote, &config.upload_retry)
        .context("Failed to initialise remote storage client")?;
    tracing::info!(destination = %remote.describe(), "remote storage configured");

    let deps = OrchestratorDeps {
        producer: Arc::new(PgDumpProducer::new(config.dump.clone())),
        remote,
        history: HistoryRecorder::new(history, config.history.write_timeout),
        restorer: Arc::new(PgRestoreExecutor::new(config.dump.clone())),
    };
    Ok(BackupOrchestrator::new(deps, config.dump.temp_dir.clone(), cancel))
}

async fn serve(
    config: AppConfig,
    orchestrator: Arc<BackupOrchestrator>,
    history: Arc<dyn HistoryStore>,
    cancel: CancellationToken,
) -> Result<()> {
    let scheduler = BackupScheduler::spawn(Arc::clone(&orchestrator), &config.scheduler, cancel.clone());

    let state = api::AppState {
        orchestrator,
        history,
        auth: Arc::new(api::AuthSettings::new(&config.server.jwt_secret, config.server.admin_role.clone())),
    };
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    tracing::info!("Listening on {}", config.server.bind_address);

    let shutdown = cancel.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "backup scheduler task ended abnormally");
        }
    }
    tracing::info!("shutdown complete");
    Ok(())
}

fn report(outcome: BackupOutcome) -> ExitCode {
    match &outcome.result {
        RunResult::Completed { message, .. } => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        RunResult::Failed { reason, .. } => {
            eprintln!("{} failed: {}", outcome.attempt.artifact_name, reason);
            ExitCode::FAILURE
        }
    }
}
