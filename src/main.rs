use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use faultline::breaker::CircuitBreaker;
use faultline::config::{Config, DatabaseConfig};
use faultline::db::{self, IncidentFilter};
use faultline::event;
use faultline::executor::InvestigatorExecutor;
use faultline::incident::IncidentStatus;
use faultline::notify::LogNotifier;
use faultline::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "faultline", about = "Incident execution and resilience engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator against a fault event stream
    Run {
        /// NDJSON fault event file; reads stdin when omitted
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Apply the database schema and exit
    Migrate,

    /// Probe state store connectivity
    Health,

    /// List incidents as JSON
    Incidents {
        /// Status filter, repeatable (investigating|resolved|failed|agent_failed)
        #[arg(long)]
        status: Vec<String>,

        #[arg(long)]
        cluster: Option<String>,

        #[arg(long)]
        namespace: Option<String>,

        #[arg(long)]
        fault_type: Option<String>,

        #[arg(long)]
        severity: Option<String>,

        /// Max rows to print (most recent first)
        #[arg(long)]
        limit: Option<i64>,

        /// Rows to skip before printing
        #[arg(long)]
        offset: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { events } => run(events).await,
        Command::Migrate => migrate().await,
        Command::Health => health().await,
        Command::Incidents {
            status,
            cluster,
            namespace,
            fault_type,
            severity,
            limit,
            offset,
        } => {
            let mut statuses = Vec::new();
            for raw in &status {
                let parsed = IncidentStatus::parse(raw)
                    .with_context(|| format!("unknown status filter: {raw}"))?;
                statuses.push(parsed);
            }
            list_incidents(IncidentFilter {
                statuses,
                cluster,
                namespace,
                fault_type,
                severity,
                created_before: None,
                created_after: None,
                limit,
                offset,
            })
            .await
        }
    }
}

async fn run(events: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::resolve().context("failed to resolve configuration")?;
    let store = db::connect_from_config(&config.database)
        .await
        .context("failed to connect to state store")?;
    store
        .run_migrations()
        .await
        .context("failed to run migrations")?;

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        InvestigatorExecutor::new(config.executor.clone()),
        Arc::new(CircuitBreaker::new(&config.breaker)),
        Arc::new(LogNotifier),
        config.workspace_root.clone(),
    );

    let (tx, rx) = mpsc::channel(64);
    let intake = match events {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open event file {}", path.display()))?;
            tokio::spawn(async move {
                event::stream_ndjson_events(file, tx).await;
            })
        }
        None => {
            tracing::info!("Reading fault events from stdin");
            tokio::spawn(async move {
                event::stream_ndjson_events(tokio::io::stdin(), tx).await;
            })
        }
    };

    orchestrator.run(rx).await;
    intake.await.context("event intake task panicked")?;
    store.close().await;
    Ok(())
}

async fn migrate() -> anyhow::Result<()> {
    let database = DatabaseConfig::resolve().context("failed to resolve configuration")?;
    let store = db::connect_from_config(&database).await?;
    store.run_migrations().await?;
    tracing::info!("Migrations applied");
    store.close().await;
    Ok(())
}

async fn health() -> anyhow::Result<()> {
    let database = DatabaseConfig::resolve().context("failed to resolve configuration")?;
    let store = db::connect_from_config(&database).await?;
    store.health_check().await.context("state store unhealthy")?;
    println!("ok");
    store.close().await;
    Ok(())
}

async fn list_incidents(filter: IncidentFilter) -> anyhow::Result<()> {
    let database = DatabaseConfig::resolve().context("failed to resolve configuration")?;
    let store = db::connect_from_config(&database).await?;
    store.run_migrations().await?;

    let incidents = store.list_incidents(&filter).await?;
    println!("{}", serde_json::to_string_pretty(&incidents)?);
    store.close().await;
    Ok(())
}
