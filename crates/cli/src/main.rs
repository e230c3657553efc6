//! `relay-flow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`: start the API server, plus an in-process worker when no
//!   database is configured.
//! - `worker`: start a queue worker.
//! - `migrate`: run pending database migrations.
//! - `run`: answer one question through the pipeline and print the State.
//! - `status`: print a task's record.
//! - `wait`: block until a task is terminal.

mod config;
mod services;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use api::pipeline::{CONNECTION, QUESTION, RESPONSE};
use clap::{Parser, Subcommand};
use nodes::State;
use queue::TaskId;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::services::Services;

#[derive(Parser)]
#[command(
    name = "relay-flow",
    about = "Graph-driven request pipeline with a remote job queue",
    version
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "RELAY_FLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Postgres URL; overrides `database_url` from the config file.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Start a background worker that processes queued jobs.
    Worker,
    /// Run pending database migrations.
    Migrate,
    /// Answer one question and print the final State as JSON.
    Run {
        question: String,
        /// JSON file holding the connection configuration.
        #[arg(long)]
        connection: PathBuf,
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        thread_id: Option<String>,
    },
    /// Print the current record of a task.
    Status { task_id: String },
    /// Block until a task finishes or the timeout elapses.
    Wait {
        task_id: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url;
    }

    match cli.command {
        Command::Serve { bind } => serve(config, bind).await,
        Command::Worker => worker(config).await,
        Command::Migrate => migrate(&config).await,
        Command::Run { question, connection, request_id, thread_id } => {
            run(&config, question, &connection, request_id, thread_id).await
        }
        Command::Status { task_id } => {
            let services = persistent_services(&config).await?;
            let record = services.tracker.status(&TaskId::new(task_id)).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Wait { task_id, timeout_secs } => {
            let services = persistent_services(&config).await?;
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.tracker.default_wait_timeout());
            let record = services.tracker.wait(&TaskId::new(task_id), timeout).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        trigger.cancel();
    });
    token
}

async fn persistent_services(config: &AppConfig) -> anyhow::Result<Services> {
    if config.database_url.is_none() {
        bail!("this command needs a database; set DATABASE_URL or database_url in the config file");
    }
    Services::connect(config).await
}

async fn serve(config: AppConfig, bind: Option<String>) -> anyhow::Result<()> {
    let services = Services::connect(&config).await?;
    let state = services.app_state(&config)?;
    let shutdown = shutdown_token();

    let local_worker = services.in_memory.then(|| {
        let worker = services.worker(&config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    });

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    api::serve(&bind, state, shutdown.clone()).await?;

    shutdown.cancel();
    if let Some(handle) = local_worker {
        handle.await.context("in-process worker panicked")?;
    }
    Ok(())
}

async fn worker(config: AppConfig) -> anyhow::Result<()> {
    let services = persistent_services(&config).await?;
    services.worker(&config).run(shutdown_token()).await;
    Ok(())
}

async fn migrate(config: &AppConfig) -> anyhow::Result<()> {
    let Some(url) = &config.database_url else {
        bail!("migrate needs DATABASE_URL or database_url in the config file");
    };
    let pool = db::create_pool(url, &config.database).await?;
    db::run_migrations(&pool).await?;
    info!("migrations applied");
    Ok(())
}

async fn run(
    config: &AppConfig,
    question: String,
    connection: &Path,
    request_id: Option<String>,
    thread_id: Option<String>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(connection)
        .with_context(|| format!("cannot read {}", connection.display()))?;
    let connection: Value =
        serde_json::from_str(&raw).context("connection file is not valid JSON")?;

    let services = Services::connect(config).await?;
    let executor = services.executor(config)?;

    let shutdown = CancellationToken::new();
    let local_worker = services.in_memory.then(|| {
        let worker = services.worker(config);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    });

    let request_id = request_id.unwrap_or_else(|| TaskId::generate().to_string());
    let mut state = State::new(request_id);
    state.set(QUESTION, question)?;
    state.insert_raw(CONNECTION.name(), connection);

    let state = executor.invoke(state, thread_id.as_deref()).await;

    shutdown.cancel();
    if let Some(handle) = local_worker {
        handle.await.context("in-process worker panicked")?;
    }

    println!("{}", serde_json::to_string_pretty(&state)?);
    if let Some(response) = state.get(RESPONSE) {
        eprintln!("{response}");
    }
    Ok(())
}
