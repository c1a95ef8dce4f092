//! Composition root: wires a [`Store`] (Redis-backed in
//! production), the [`Scheduler`], the [`AuditLogger`], and the admin
//! HTTP/telemetry services behind one [`PlatformContext`], then owns
//! their [`CancellationToken`] tree for a clean shutdown.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit_logging::AuditLogger;
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::platform::config::{AuditSettings, MeshConfig};
use crate::platform::context::PlatformContext;
use crate::platform::service::ServiceRegistration;
use crate::platform::telemetry::telemetry_service;
use crate::scheduler::Scheduler;
use crate::store::{RedisStore, Store};
use crate::worker::{stub_job_fn, Worker, WorkerConfig};

pub struct Platform {
    config: MeshConfig,
    services: Vec<ServiceRegistration>,
}

impl Platform {
    pub fn new(config: MeshConfig) -> Self {
        let mut services = Vec::new();
        services.push(telemetry_service(config.observability.clone()));

        Self { config, services }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.services.push(service);
    }

    /// Connects to Redis, builds the scheduler and audit logger, then
    /// spawns every registered service under one root token.
    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&self.config.redis_url).await?);
        let scheduler = Arc::new(Scheduler::new(store.clone(), Default::default()));
        let audit_logger = Arc::new(init_audit_logger(&self.config.audit)?);

        let root_token = CancellationToken::new();
        let context = PlatformContext::new(
            self.config.clone(),
            store,
            scheduler,
            audit_logger,
            root_token.child_token(),
        );

        let mut tasks = Vec::new();
        let mut services = self.services;
        services.push(admin_http_service(self.config.http_port));

        for service in services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!("platform boot completed");

        Ok(PlatformRuntime {
            context,
            cancel_token: root_token,
            tasks,
        })
    }
}

/// Wraps [`crate::http::serve`] as a [`ServiceRegistration`] so the admin
/// surface shares the same shutdown token as every other service.
fn admin_http_service(port: u16) -> ServiceRegistration {
    ServiceRegistration::new(
        "admin-http",
        Arc::new(move |ctx, token| tokio::spawn(crate::http::serve(ctx, port, token))),
    )
}

/// Runs the foreground coordinator loops for `run --role=coordinator`.
/// Not a [`ServiceRegistration`]: the CLI awaits it directly so a plain
/// `tokio::spawn` per role is enough. `Coordinator::run` performs its own
/// startup cleanup (clear-all or orphan salvage, per `durable`) before
/// spawning its loops.
pub async fn run_coordinator(context: &PlatformContext, token: CancellationToken) -> Result<()> {
    let config: CoordinatorConfig = context.config().coordinator_config();
    let coordinator = Arc::new(Coordinator::new(context.store().clone(), context.scheduler().clone(), config));
    coordinator.run(token).await
}

/// Runs the foreground worker (+ optional stealer/autoscaler) for
/// `run --role=worker`, reusing [`crate::pool::run`] so the CLI path and
/// the admin API's dynamically started workers share one composition.
pub async fn run_worker(context: &PlatformContext, token: CancellationToken) -> Result<()> {
    let worker_config: WorkerConfig = context.config().worker_config();
    let worker_id = format!("w_{}", uuid::Uuid::new_v4().simple());
    let worker = Worker::new(context.store().clone(), worker_id, worker_config, stub_job_fn());
    crate::pool::run(worker, token, context.config().enable_steal, context.config().autoscaler_config()).await;
    Ok(())
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => {
                    return Err(err);
                }
                Err(err) => {
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }
}

fn initialize_logging(config: &MeshConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}

fn init_audit_logger(settings: &AuditSettings) -> Result<AuditLogger> {
    AuditLogger::new(&settings.log_path, settings.retention_days)
        .map_err(|err| anyhow::anyhow!(err.to_string()))
}
