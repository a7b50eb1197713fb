//! cancelable-worker: run container-backed queue tasks that can be stopped
//! one at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cancelable_worker::channel::{ChannelRouter, RedisTransport};
use cancelable_worker::config::redis_url_for_host;
use cancelable_worker::constants::CANCEL_PAYLOAD;
use cancelable_worker::queue::{RedisQueue, TaskQueue, TaskRequest};
use cancelable_worker::runtime::DockerCli;
use cancelable_worker::{channel_key, logging, QueueError, TaskExecutor, Worker, WorkerConfig};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Queue worker for container-backed tasks with per-task cancellation
#[derive(Parser)]
#[command(name = "cancelable-worker")]
#[command(about = "Run, enqueue, list and cancel container-backed tasks", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "WORKER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Redis URL for the queue and cancellation channels
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Redis host name, used when no URL is given
    #[arg(long, env = "REDIS_HOST", global = true, hide = true)]
    redis_host: Option<String>,

    /// Queue name
    #[arg(long = "queue", env = "QUEUE_NAME", global = true)]
    queue_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Worker {
        /// Maximum number of tasks running at once
        #[arg(long, env = "WORKER_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Do not copy workload output to stdout
        #[arg(long)]
        quiet: bool,
    },

    /// Enqueue a task
    ///
    /// Without a command, runs the 30-second demo loop.
    Add {
        /// Container image (defaults to the configured default image)
        #[arg(long)]
        image: Option<String>,

        /// Command to run in the container
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List every task and its state
    List,

    /// Cancel a waiting or running task
    Stop {
        /// Id of the task to cancel
        task_id: String,
    },
}

impl Cli {
    fn resolve_config(&self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => WorkerConfig::default(),
        };
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        } else if let Some(host) = &self.redis_host {
            config.redis_url = redis_url_for_host(host);
        }
        if let Some(name) = &self.queue_name {
            config.queue_name = name.clone();
        }
        if let Commands::Worker { concurrency, quiet } = &self.command {
            if let Some(n) = concurrency {
                config.concurrency = *n;
            }
            if *quiet {
                config.forward_output = false;
            }
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_directive = match cli.command {
        Commands::Worker { .. } => "info",
        _ => "warn",
    };
    logging::init(default_directive);

    let config = cli.resolve_config()?;
    match cli.command {
        Commands::Worker { .. } => run_worker(&config).await,
        Commands::Add { image, command } => add_task(&config, image, command).await,
        Commands::List => list_tasks(&config).await,
        Commands::Stop { task_id } => stop_task(&config, &task_id).await,
    }
}

async fn connect_router(config: &WorkerConfig) -> Result<Arc<ChannelRouter>> {
    let (transport, inbound) = RedisTransport::connect(&config.redis_url)
        .await
        .context("failed to connect to the notification channel")?;
    Ok(ChannelRouter::spawn(Arc::new(transport), inbound))
}

async fn connect_queue(config: &WorkerConfig) -> Result<RedisQueue> {
    RedisQueue::new(&config.redis_url, config.queue_name.as_str())
        .await
        .context("failed to connect to the task queue")
}

async fn run_worker(config: &WorkerConfig) -> Result<()> {
    let router = connect_router(config).await?;
    let queue = connect_queue(config).await?;
    let runtime = DockerCli::new().with_binary(config.docker_bin.as_str());
    let executor = TaskExecutor::new(Arc::new(runtime), router)
        .with_output_forwarding(config.forward_output);
    let worker = Worker::new(Arc::new(queue), Arc::new(executor))
        .with_concurrency(config.concurrency)
        .with_poll_interval(config.poll_interval());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        }
    });

    info!(queue = %config.queue_name, redis = %config.redis_url, "Worker started");
    worker.run(shutdown).await;
    Ok(())
}

async fn add_task(config: &WorkerConfig, image: Option<String>, command: Vec<String>) -> Result<()> {
    let queue = connect_queue(config).await?;
    let request = TaskRequest {
        image: image.unwrap_or_else(|| config.default_image.clone()),
        command: (!command.is_empty()).then_some(command),
    };
    let task = queue.enqueue(request).await.context("failed to enqueue task")?;
    println!("Added task {}", task.id());
    Ok(())
}

async fn list_tasks(config: &WorkerConfig) -> Result<()> {
    let queue = connect_queue(config).await?;
    for entry in queue.list().await.context("failed to list tasks")? {
        println!("{}: {} [{}]", entry.task.id(), entry.task.image(), entry.state);
    }
    Ok(())
}

async fn stop_task(config: &WorkerConfig, task_id: &str) -> Result<()> {
    let queue = connect_queue(config).await?;
    let state = match queue.state(task_id).await {
        Ok(state) => state,
        Err(QueueError::NotFound { .. }) => bail!("Task {task_id} not found"),
        Err(e) => return Err(e).context("failed to read task state"),
    };
    if state.is_terminal() {
        bail!("Task {task_id} is already {state}; nothing to cancel");
    }

    println!("Publishing cancel for task {task_id} (current state: {state})");
    let router = connect_router(config).await?;
    let receivers = router
        .publish(&channel_key(task_id), CANCEL_PAYLOAD)
        .await
        .context("failed to publish cancellation")?;
    if receivers == 0 {
        println!("No worker is running task {task_id} yet; the request was dropped");
    }
    Ok(())
}
