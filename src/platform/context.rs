//! Process-wide handle shared across every spawned service and HTTP
//! handler: the store, scheduler, metrics probe, worker registry, audit
//! logger, and rate limiter, behind one cheap-to-clone `Arc`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::admin::WorkerRegistry;
use crate::audit_logging::{AuditEvent, AuditLogger, AuditSeverity};
use crate::metrics::MetricsProbe;
use crate::platform::config::MeshConfig;
use crate::rate_limiting::{RateLimit, RateLimitConfig, RateLimiter};
use crate::scheduler::Scheduler;
use crate::store::Store;

#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: MeshConfig,
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsProbe>,
    workers: WorkerRegistry,
    audit_logger: Arc<AuditLogger>,
    rate_limiter: Arc<RateLimiter>,
}

impl PlatformContext {
    pub(crate) fn new(
        config: MeshConfig,
        store: Arc<dyn Store>,
        scheduler: Arc<Scheduler>,
        audit_logger: Arc<AuditLogger>,
        shutdown: CancellationToken,
    ) -> Self {
        let metrics = Arc::new(MetricsProbe::new(store.clone()));
        let workers = WorkerRegistry::new(store.clone());
        let rate_limiter = Arc::new(RateLimiter::from_settings(&config.rate_limiting));

        Self {
            shared: Arc::new(SharedState {
                config,
                store,
                scheduler,
                metrics,
                workers,
                audit_logger,
                rate_limiter,
            }),
            shutdown,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    pub fn metrics(&self) -> &Arc<MetricsProbe> {
        &self.shared.metrics
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.shared.workers
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Records an admin-API action. Best-effort: a logging failure never
    /// fails the request it's describing.
    pub fn audit_log(&self, action: &str, detail: &str) {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: 0,
            event_type: "admin_api".to_string(),
            user_id: None,
            resource: "taskmesh".to_string(),
            action: action.to_string(),
            result: detail.to_string(),
            ip_address: None,
            user_agent: None,
            metadata: HashMap::new(),
            severity: AuditSeverity::Low,
        };
        if let Err(err) = self.shared.audit_logger.log_event(event) {
            tracing::warn!(error = %err, "audit log write failed");
        }
    }

    pub fn check_rate_limit(&self, client_ip: IpAddr, endpoint: &str) -> Result<(), crate::rate_limiting::RateLimitError> {
        self.shared.rate_limiter.check_rate_limit(client_ip, endpoint)
    }
}

impl RateLimiter {
    pub fn from_settings(settings: &crate::platform::config::RateLimitingSettings) -> Self {
        use std::time::Duration;

        let default = RateLimit {
            requests: settings.default.requests,
            window: Duration::from_secs(settings.default.window_seconds),
        };

        let endpoints = settings
            .endpoints
            .iter()
            .map(|(endpoint, rule)| {
                (
                    endpoint.clone(),
                    RateLimit {
                        requests: rule.requests,
                        window: Duration::from_secs(rule.window_seconds),
                    },
                )
            })
            .collect();

        RateLimiter::new(RateLimitConfig {
            default,
            endpoints,
            burst_limit: settings.default.burst,
        })
    }
}
