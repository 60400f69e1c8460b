use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dropdeploy::api::{self, AppState};
use dropdeploy::config::Config;
use dropdeploy::engine::{ContainerEngine, DockerEngine};
use dropdeploy::gateway::CommandGateway;
use dropdeploy::logging;
use dropdeploy::orchestrator::Orchestrator;
use dropdeploy::queue::{JobQueue, RedisQueue};
use dropdeploy::repo::RepoManager;
use dropdeploy::store::{DbHandle, StoreDb};
use dropdeploy::worker::WorkerRuntime;

#[derive(Parser)]
#[command(name = "dropdeploy")]
#[command(version, about = "Deployment platform core: repo in, running container out")]
struct Cli {
    /// Path to the configuration file (default: ./dropdeploy.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API consumed by the authenticated frontend layer
    Serve {
        /// Port to listen on (overrides the configured api_port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start the deployment worker pool
    Worker {
        /// Concurrent pipelines (overrides the configured worker_concurrency)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Worker { concurrency } => worker(config, concurrency).await,
    }
}

struct Components {
    db: DbHandle,
    queue: Arc<RedisQueue>,
    engine: Arc<dyn ContainerEngine>,
    orchestrator: Arc<Orchestrator>,
}

/// Build the component graph shared by both subcommands.
async fn build_components(config: &Config) -> Result<Components> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(StoreDb::new(&config.db_path).context("Failed to open entity store")?);

    let queue = Arc::new(
        RedisQueue::new(&config.queue_url()).context("Failed to configure queue backend")?,
    );

    let engine: Arc<dyn ContainerEngine> = Arc::new(
        DockerEngine::connect(
            &config.container_engine_socket,
            &config.container_prefix,
            config.memory_limit_bytes,
            config.cpu_shares,
        )
        .await
        .context("Failed to connect to the container engine")?,
    );

    let repos = Arc::new(RepoManager::new(config.projects_root.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        queue.clone() as Arc<dyn JobQueue>,
        Arc::clone(&engine),
        repos,
        &config.container_prefix,
    ));

    Ok(Components {
        db,
        queue,
        engine,
        orchestrator,
    })
}

async fn serve(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.api_port);
    let components = build_components(&config).await?;
    let gateway = Arc::new(CommandGateway::new(
        components.engine,
        &config.container_prefix,
    ));

    let state = Arc::new(AppState {
        db: components.db,
        orchestrator: components.orchestrator,
        gateway,
        container_prefix: config.container_prefix.clone(),
    });
    api::start_server(state, port).await
}

async fn worker(config: Config, concurrency: Option<usize>) -> Result<()> {
    let concurrency = concurrency.unwrap_or(config.worker_concurrency);
    let components = build_components(&config).await?;

    // A dead backend is fatal here: a worker that can never receive jobs
    // should exit non-zero instead of idling.
    components.queue.connect().await.with_context(|| {
        format!("Failed to connect to queue backend at {}", config.queue_url())
    })?;

    components
        .orchestrator
        .sweep_stuck_building()
        .await
        .context("Failed to sweep orphaned deployments")?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = stop_tx.send(true);
    });

    WorkerRuntime::new(
        components.queue as Arc<dyn JobQueue>,
        components.orchestrator,
        concurrency,
    )
    .run(stop_rx)
    .await;
    Ok(())
}
