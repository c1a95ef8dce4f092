//! taskmesh CLI: `run` starts a coordinator or worker process and
//! the admin/telemetry HTTP surfaces; `submit` enqueues one task against
//! a running mesh and optionally polls for its result.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use taskmesh::model::Task;
use taskmesh::platform::{run_coordinator, run_worker, MeshConfig, Platform};
use taskmesh::store::{RedisStore, Store};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Distributed task-dispatch and worker-lifecycle platform", long_about = None)]
struct Cli {
    /// Optional TOML config file, overridden by TASKMESH_* env vars.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a coordinator or worker process plus the admin/telemetry HTTP surfaces.
    Run {
        #[arg(long, value_enum)]
        role: Role,
        #[arg(long)]
        redis: Option<String>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        steal: bool,
        #[arg(long)]
        min: Option<usize>,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Submits one task and optionally waits for its result.
    Submit {
        #[arg(long)]
        redis: Option<String>,
        #[arg(long, default_value = "generic")]
        task_type: String,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "5")]
        priority: u8,
        #[arg(long)]
        deadline: Option<String>,
        #[arg(long, default_value = "3")]
        retries: u32,
        #[arg(long)]
        monitor: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Role {
    Coordinator,
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let mut config = MeshConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { role, redis, workers, steal, min, max } => {
            if let Some(redis) = redis {
                config.redis_url = redis;
            }
            if let Some(workers) = workers {
                config.pool_size = workers;
            }
            config.enable_steal = config.enable_steal || steal;
            if let Some(min) = min {
                config.min_workers = min;
            }
            if let Some(max) = max {
                config.max_workers = max;
            }

            run(config, role).await
        }
        Command::Submit { redis, task_type, payload, priority, deadline, retries, monitor } => {
            if let Some(redis) = redis {
                config.redis_url = redis;
            }
            submit(config, task_type, payload, priority, deadline, retries, monitor).await
        }
    }
}

async fn run(config: MeshConfig, role: Role) -> anyhow::Result<()> {
    let platform = Platform::new(config);
    let runtime = platform.start().await?;
    let context = runtime.context();
    let shutdown = runtime.shutdown_token();

    let role_token = shutdown.child_token();
    let role_handle = tokio::spawn(async move {
        match role {
            Role::Coordinator => run_coordinator(&context, role_token).await,
            Role::Worker => run_worker(&context, role_token).await,
        }
    });

    wait_for_signal().await;
    info!("shutdown signal received");
    runtime.shutdown().await?;
    if let Err(err) = role_handle.await? {
        error!(error = %err, "role loop exited with error");
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn submit(
    config: MeshConfig,
    task_type: String,
    payload: Option<String>,
    priority: u8,
    deadline: Option<String>,
    retries: u32,
    monitor: bool,
) -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.observability.log_level.as_str())
        .try_init();

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let scheduler = taskmesh::scheduler::Scheduler::new(store.clone(), Default::default());

    let mut task = Task::new(task_type, payload.unwrap_or_default().into_bytes());
    task.priority = priority.clamp(1, 10);
    task.max_retries = retries;
    task.deadline = match deadline {
        Some(raw) => Some(chrono::DateTime::parse_from_rfc3339(&raw)?.timestamp()),
        None => None,
    };

    let task_id = task.id.clone();
    scheduler.enqueue(task).await?;
    info!(task_id = %task_id, "task submitted");

    if monitor {
        loop {
            if let Some(result) = store.results_get(&task_id).await? {
                println!("{}", serde_json::to_string_pretty(&result)?);
                break;
            }
            if let Some(result) = store.failed_get(&task_id).await? {
                println!("{}", serde_json::to_string_pretty(&result)?);
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    } else {
        println!("{task_id}");
    }

    Ok(())
}
