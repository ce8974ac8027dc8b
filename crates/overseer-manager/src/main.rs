use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::{Parser, Subcommand};
use overseer_core::{EcologySource, Invoker, Notifier, Task, WindowState};
use overseer_manager::config::{InvokerKind, StorageBackend};
use overseer_manager::{
    ControlConfig, ControlMetrics, HttpInvoker, LogNotifier, Orchestrator, Scavenger,
    StaticEcology, TaskManager, WebhookNotifier,
};
use overseer_persistence::{IndexedStore, MemoryStore, RocksStore, RocksStoreConfig};
use overseer_worker::{Dispatch, EchoHandler, LocalInvoker, TaskHandlerRegistry, WorkerRuntime};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ov-control")]
#[command(about = "Overseer task orchestration control plane", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a configuration key, e.g. `--set scavenger.interval_secs=5`
    #[arg(long = "set", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run orchestrator and scavenger loops until interrupted
    Run,

    /// Run a single orchestration cycle
    Orchestrate,

    /// Run a single scavenger sweep
    Scavenge,

    /// Queue a task for a labourer
    Submit {
        /// Labourer id
        #[arg(short, long)]
        labourer: String,

        /// JSON payload
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// Show queue state per labourer, or the lease state of one task
    Status {
        /// Task id
        #[arg(short, long)]
        task: Option<String>,
    },
}

fn parse_override(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[derive(Serialize)]
struct LabourerStatus {
    labourer: String,
    health: Option<u8>,
    queued: usize,
    running: usize,
    expired: usize,
    awaiting_archive: usize,
    average_duration: Option<u64>,
    max_duration: Option<u64>,
}

#[derive(Serialize)]
struct TaskStatus {
    task: Task,
    state: WindowState,
}

/// Everything one process needs, wired together.
struct ControlPlane {
    config: ControlConfig,
    task_manager: Arc<TaskManager>,
    ecology: Arc<dyn EcologySource>,
    notifier: Arc<dyn Notifier>,
    worker: Option<(Arc<WorkerRuntime>, JoinHandle<anyhow::Result<()>>)>,
}

impl ControlPlane {
    fn build(config: ControlConfig) -> anyhow::Result<Self> {
        let metrics = Arc::new(ControlMetrics::new()?);
        let schemas = config.task_manager.schemas();

        let store: Arc<dyn IndexedStore> = match config.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using the in-memory store, tasks are lost on exit");
                Arc::new(MemoryStore::new(schemas))
            }
            StorageBackend::Rocksdb => Arc::new(
                RocksStore::open(
                    RocksStoreConfig {
                        data_dir: config.storage.data_dir.clone(),
                    },
                    schemas,
                )
                .context("failed to open task store")?,
            ),
        };

        let (invoker, receiver): (Arc<dyn Invoker>, Option<mpsc::Receiver<Dispatch>>) =
            match config.invoker.kind {
                InvokerKind::Local => {
                    let (invoker, receiver) = LocalInvoker::channel(config.worker.queue_capacity);
                    (Arc::new(invoker), Some(receiver))
                }
                InvokerKind::Http => (Arc::new(HttpInvoker::new(&config.invoker)?), None),
            };

        let task_manager = Arc::new(
            TaskManager::builder()
                .config(config.task_manager.clone())
                .store(store)
                .invoker(invoker)
                .metrics(metrics)
                .build()?,
        );

        let worker = receiver.map(|receiver| {
            let registry = TaskHandlerRegistry::new();
            for labourer in &config.task_manager.labourers {
                registry.register(&labourer.id, EchoHandler);
            }

            let runtime = Arc::new(WorkerRuntime::new(
                config.worker.clone(),
                registry,
                task_manager.clone(),
            ));
            let handle = tokio::spawn(runtime.clone().run(receiver));
            (runtime, handle)
        });

        let notifier: Arc<dyn Notifier> = match &config.notifier.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        Ok(ControlPlane {
            ecology: Arc::new(StaticEcology::new(&config.ecology)),
            config,
            task_manager,
            notifier,
            worker,
        })
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.task_manager.clone(),
            self.ecology.clone(),
            self.config.orchestrator.clone(),
        )
    }

    fn scavenger(&self) -> Scavenger {
        Scavenger::new(
            self.task_manager.clone(),
            self.ecology.clone(),
            self.notifier.clone(),
            self.config.scavenger.clone(),
        )
    }

    /// Let the local worker finish what it has accepted.
    async fn shutdown(self) -> anyhow::Result<()> {
        if let Some((runtime, handle)) = self.worker {
            runtime.shutdown();
            handle.await??;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = ControlConfig::load(args.config.as_deref(), &args.overrides)?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::debug!("Loaded config: {:?}", config);

    let plane = ControlPlane::build(config)?;

    match args.command {
        Commands::Run => run(&plane).await?,
        Commands::Orchestrate => {
            let report = plane.orchestrator().run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Scavenge => {
            let report = plane.scavenger().run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Submit { labourer, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let task_id = submit(&plane, &labourer, payload).await?;
            println!("{}", task_id);
        }
        Commands::Status { task: None } => {
            let status = status(&plane).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Status { task: Some(task_id) } => {
            let status = task_status(&plane, &task_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    plane.shutdown().await
}

async fn run(plane: &ControlPlane) -> anyhow::Result<()> {
    let metrics = plane.task_manager.metrics().clone();
    let metrics_port = plane.config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let orchestrator = plane.orchestrator();
    let scavenger = plane.scavenger();
    let mut orchestrate_every =
        tokio::time::interval(Duration::from_secs(plane.config.orchestrator.interval_secs.max(1)));
    let mut scavenge_every =
        tokio::time::interval(Duration::from_secs(plane.config.scavenger.interval_secs.max(1)));

    tracing::info!(
        "Control plane running with {} labourers",
        plane.config.task_manager.labourers.len()
    );

    loop {
        tokio::select! {
            _ = orchestrate_every.tick() => {
                if let Err(e) = orchestrator.run_cycle().await {
                    tracing::error!("Orchestration cycle failed: {}", e);
                }
            }
            _ = scavenge_every.tick() => {
                if let Err(e) = scavenger.run_cycle().await {
                    tracing::error!("Scavenger sweep failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping");
                return Ok(());
            }
        }
    }
}

async fn submit(
    plane: &ControlPlane,
    labourer_id: &str,
    payload: serde_json::Value,
) -> anyhow::Result<String> {
    let labourers = plane
        .task_manager
        .register_labourers(plane.ecology.as_ref())
        .await?;
    let labourer = labourers
        .iter()
        .find(|l| l.id == labourer_id)
        .with_context(|| format!("unknown labourer {}", labourer_id))?;

    let mut fields = overseer_core::Row::new();
    fields.insert(overseer_core::fields::PAYLOAD.to_string(), payload);
    Ok(plane.task_manager.create_task(labourer, fields).await?)
}

async fn status(plane: &ControlPlane) -> anyhow::Result<Vec<LabourerStatus>> {
    let task_manager = &plane.task_manager;
    let labourers = task_manager
        .register_labourers(plane.ecology.as_ref())
        .await?;

    let mut status = Vec::with_capacity(labourers.len());
    for labourer in &labourers {
        status.push(LabourerStatus {
            labourer: labourer.id.clone(),
            health: labourer.health,
            queued: task_manager.get_length_of_queue_for_labourer(labourer).await?,
            running: task_manager
                .get_count_of_running_tasks_for_labourer(labourer)
                .await?,
            expired: task_manager
                .get_expired_tasks_for_labourer(labourer)
                .await?
                .len(),
            awaiting_archive: task_manager
                .get_closed_tasks_for_labourer(labourer)
                .await?
                .len(),
            average_duration: labourer.average_duration,
            max_duration: labourer.max_duration,
        });
    }
    Ok(status)
}

async fn task_status(plane: &ControlPlane, task_id: &str) -> anyhow::Result<TaskStatus> {
    let task_manager = &plane.task_manager;
    let task = task_manager
        .get_task_by_id(task_id)
        .await?
        .with_context(|| format!("task {} is not in the live table", task_id))?;

    let labourers = task_manager
        .register_labourers(plane.ecology.as_ref())
        .await?;
    let labourer = labourers
        .iter()
        .find(|l| l.id == task.labourer_id)
        .with_context(|| format!("task {} belongs to unknown labourer {}", task_id, task.labourer_id))?;

    let (task, state) = task_manager
        .get_task_state(labourer, task_id)
        .await?
        .with_context(|| format!("task {} left the live table", task_id))?;
    Ok(TaskStatus { task, state })
}

async fn start_metrics_server(metrics: Arc<ControlMetrics>, port: u16) -> anyhow::Result<()> {
    async fn metrics_handler(
        State(metrics): State<Arc<ControlMetrics>>,
    ) -> Result<String, (StatusCode, String)> {
        metrics
            .encode()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
