use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::event::EventBus;
use trellis_core::traits::{ChatClient, JobQueue, ToolInvoker, WorkflowStore};
use trellis_engine::{HandlerDeps, MemoryQueue, RunCoordinator, WorkerPool};
use trellis_gateway::GatewayServer;
use trellis_llm::{OpenAiClient, RetryingClient};
use trellis_store::SqliteStore;
use trellis_tools::HttpToolInvoker;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Workflow-graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and the worker pool
    Serve,
    /// Start workers only (no HTTP surface)
    Worker,
    /// Show the effective configuration
    Config,
}

struct Runtime {
    config: AppConfig,
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<EventBus>,
    coordinator: Arc<RunCoordinator>,
    deps: HandlerDeps,
}

fn build_runtime(config: AppConfig) -> anyhow::Result<Runtime> {
    let store: Arc<dyn WorkflowStore> =
        Arc::new(SqliteStore::open(std::path::Path::new(&config.store.path))?);
    let bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(Duration::from_secs(
        config.queue.visibility_timeout_secs,
    )));

    let llm: Arc<dyn ChatClient> = Arc::new(RetryingClient::new(
        Box::new(OpenAiClient::new(&config.model)?),
        config.retry.clone(),
    ));
    let tools: Arc<dyn ToolInvoker> = Arc::new(HttpToolInvoker::new(
        config.model.request_timeout_secs,
        config.retry.clone(),
    )?);

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        queue.clone(),
        bus.clone(),
    ));
    let deps = HandlerDeps {
        store: store.clone(),
        llm,
        tools,
        config: config.clone(),
    };

    Ok(Runtime {
        config,
        store,
        queue,
        bus,
        coordinator,
        deps,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Worker => {
            let runtime = build_runtime(config)?;
            let cancel = CancellationToken::new();
            let workers = WorkerPool::spawn(
                runtime.config.engine.workers,
                runtime.queue.clone(),
                runtime.bus.clone(),
                runtime.coordinator.clone(),
                runtime.deps.clone(),
                cancel.clone(),
            );
            info!(workers = workers.len(), "Worker pool running");

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            cancel.cancel();
            for handle in workers {
                let _ = handle.await;
            }
            Ok(())
        }
        Commands::Serve => {
            let runtime = build_runtime(config)?;
            let cancel = CancellationToken::new();

            let workers = WorkerPool::spawn(
                runtime.config.engine.workers,
                runtime.queue.clone(),
                runtime.bus.clone(),
                runtime.coordinator.clone(),
                runtime.deps.clone(),
                cancel.clone(),
            );
            info!(workers = workers.len(), "Worker pool running");

            let gateway = GatewayServer::new(
                runtime.config.gateway.clone().unwrap_or_default(),
                runtime.store.clone(),
                runtime.coordinator.clone(),
                runtime.bus.clone(),
            );

            let server_cancel = cancel.clone();
            let server = tokio::spawn(async move { gateway.run(server_cancel).await });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            cancel.cancel();

            let _ = server.await?;
            for handle in workers {
                let _ = handle.await;
            }
            Ok(())
        }
    }
}
