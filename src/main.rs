mod api;
mod cli;
mod config;
mod delivery;
mod error;
mod logging;
mod oracle;
mod payment;
mod state_machine;
mod store;
mod supervisor;
mod ui;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use tracing::{info, warn};

use cli::{Cli, Command};
use config::{StoreBackendKind, WorkerMode, WorkheroConfig};
use delivery::{DeliveryPipeline, SmtpMailer};
use oracle::PriceOracle;
use payment::SolanaRpc;
use state_machine::WorkItemLifecycle;
use store::{AnyBackend, RemoteBackend, SqliteBackend, WorkItemStore};
use supervisor::{ExecutionSupervisor, SupervisorConfig};
use worker::{BrokerClient, Worker, shutdown_on_ctrl_c};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_console_subscriber(cli.verbose);
    let config = WorkheroConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Worker {
            once,
            progress,
            local,
        } => run_worker(config, once, progress, local).await,
        Command::InitDb => {
            open_store(&config).await?;
            println!("  {} database ready", Style::new().green().bold().apply_to("✓"));
            Ok(())
        }
        Command::Exec { minutes, dir, task } => {
            let supervisor = ExecutionSupervisor::new(SupervisorConfig::from(&config.worker));
            let result = supervisor.run(&task, minutes, &dir).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("execution failed");
            }
            Ok(())
        }
    }
}

/// Opens the configured backend and makes sure the schema exists.
async fn open_store(config: &WorkheroConfig) -> Result<WorkItemStore<AnyBackend>> {
    let backend = match config.store.backend {
        StoreBackendKind::Local => {
            AnyBackend::Local(SqliteBackend::open(&config.store.path).await.with_context(|| {
                format!("opening database {}", config.store.path.display())
            })?)
        }
        StoreBackendKind::Remote => AnyBackend::Remote(RemoteBackend::new(
            &config.store.url,
            Some(config.store.auth_token.clone()),
        )?),
    };
    let store = WorkItemStore::new(backend);
    store.bootstrap().await.context("creating schema")?;
    Ok(store)
}

async fn serve(config: WorkheroConfig) -> Result<()> {
    if config.ledger.payment_address.is_empty() {
        warn!("ledger.payment_address is empty; payments can never be matched");
    }
    if config.server.worker_api_key.is_empty() {
        warn!("no worker API key configured; worker endpoints will reject every request");
    }

    let store = open_store(&config).await?;
    let oracle = PriceOracle::new(&config.price)?;
    let ledger = SolanaRpc::new(config.ledger.rpc_url.clone())?;
    let state = Arc::new(api::AppState::new(
        WorkItemLifecycle::new(store),
        oracle,
        ledger,
        config.server.clone(),
        &config.ledger,
    ));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    info!(addr = %config.server.bind, "listening");
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn run_worker(config: WorkheroConfig, once: bool, progress: bool, local: bool) -> Result<()> {
    let supervisor = ExecutionSupervisor::new(SupervisorConfig::from(&config.worker));
    let delivery = DeliveryPipeline::new(SmtpMailer::new(&config.mail)?);

    if local || config.worker.mode == WorkerMode::Local {
        let queue = WorkItemLifecycle::new(open_store(&config).await?);
        let worker = Worker::new(queue, supervisor, delivery, &config.worker).with_progress(progress);
        drive(&worker, once).await
    } else {
        if config.worker.api_key.is_empty() {
            warn!("no worker API key configured; the broker will reject requests");
        }
        let queue = BrokerClient::new(&config.worker.api_base_url, config.worker.api_key.clone())?;
        let worker = Worker::new(queue, supervisor, delivery, &config.worker).with_progress(progress);
        drive(&worker, once).await
    }
}

async fn drive<Q: worker::WorkQueue, M: delivery::Mailer>(
    worker: &Worker<Q, M>,
    once: bool,
) -> Result<()> {
    if once {
        let ran = worker.run_once().await?;
        info!(ran, "single poll finished");
    } else {
        worker.run(shutdown_on_ctrl_c()).await;
    }
    Ok(())
}
