//! anvil-worker: executes workflow actions on the local machine

use anvil_runtime::{ContainerAdapter, DockerCli};
use anvil_worker::{HttpClient, Worker, WorkerConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Anvil workflow worker", long_about = None)]
struct Args {
    /// Worker identity, usually the primary MAC address
    #[arg(long, env = "ANVIL_WORKER_ID")]
    worker_id: String,

    /// Orchestrator URL
    #[arg(long, env = "ANVIL_SERVER_URL", default_value = "http://localhost:42111")]
    server: String,

    /// Poll interval in seconds
    #[arg(long, env = "ANVIL_POLL_INTERVAL", default_value = "5")]
    poll_interval: u64,

    /// Root directory for shared workflow data
    #[arg(long, env = "ANVIL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Container runtime binary
    #[arg(long, env = "ANVIL_DOCKER", default_value = "docker")]
    docker: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = WorkerConfig::new(&args.worker_id)
        .with_poll_interval(Duration::from_secs(args.poll_interval));
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    let client = HttpClient::new(&args.server).context("Failed to create orchestrator client")?;
    let engine = DockerCli::new(args.docker).context("Invalid container runtime")?;
    let worker = Worker::new(
        Arc::new(client),
        ContainerAdapter::new(Arc::new(engine)),
        config,
    )
    .context("Invalid worker configuration")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            shutdown.cancel();
        }
    });

    info!(server = %args.server, worker = %worker.worker_id(), "Connecting to orchestrator");
    worker.run(cancel).await.context("Worker failed")?;
    Ok(())
}
