//! Runtime configuration. Every tunable lives here as an explicit
//! field with an explicit default — no hidden defaults, no merge-from-file
//! layer built on the `config` crate (see DESIGN.md for why that
//! dependency isn't carried). An optional `--config` TOML file is read
//! first, then `TASKMESH_*`
//! environment variables override individual fields, mirroring the
//! `--config` flag plus `std::env::var` reads used by every binary here.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub redis_url: String,
    pub pool_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub enable_steal: bool,

    pub heartbeat_secs: u64,
    pub liveness_secs: i64,
    pub distribute_tick_ms: u64,
    pub reap_tick_ms: u64,
    pub monitor_tick_secs: u64,
    pub steal_tick_secs: u64,
    pub autoscale_tick_secs: u64,
    pub autoscale_cooldown_secs: i64,
    pub batch_pull: usize,

    /// When `false` (the default), the coordinator clears `Q[*]`,
    /// `Workers`, `Results`, `FailedTasks`, and every per-worker bucket on
    /// start. Set `true` to preserve state across coordinator restarts;
    /// only orphaned-bucket salvage then runs on start.
    pub durable: bool,

    pub http_port: u16,
    pub observability: ObservabilitySettings,
    pub audit: AuditSettings,
    pub rate_limiting: RateLimitingSettings,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 5,
            min_workers: 1,
            max_workers: 10,
            enable_steal: false,
            heartbeat_secs: 10,
            liveness_secs: 30,
            distribute_tick_ms: 100,
            reap_tick_ms: 100,
            monitor_tick_secs: 5,
            steal_tick_secs: 5,
            autoscale_tick_secs: 10,
            autoscale_cooldown_secs: 30,
            batch_pull: 5,
            durable: false,
            http_port: 8080,
            observability: ObservabilitySettings::default(),
            audit: AuditSettings::default(),
            rate_limiting: RateLimitingSettings::default(),
        }
    }
}

impl MeshConfig {
    /// Loads optional TOML overrides from `path`, then applies
    /// `TASKMESH_*` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&text).context("parsing config file as TOML")?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TASKMESH_REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = env_parse("TASKMESH_POOL_SIZE") {
            self.pool_size = v;
        }
        if let Some(v) = env_parse("TASKMESH_MIN_WORKERS") {
            self.min_workers = v;
        }
        if let Some(v) = env_parse("TASKMESH_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = env_parse("TASKMESH_ENABLE_STEAL") {
            self.enable_steal = v;
        }
        if let Some(v) = env_parse("TASKMESH_DURABLE") {
            self.durable = v;
        }
        if let Some(v) = env_parse("TASKMESH_HTTP_PORT") {
            self.http_port = v;
        }
        if let Ok(v) = std::env::var("TASKMESH_LOG_LEVEL") {
            self.observability.log_level = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl MeshConfig {
    pub fn coordinator_config(&self) -> crate::coordinator::CoordinatorConfig {
        crate::coordinator::CoordinatorConfig {
            distribute_tick: Duration::from_millis(self.distribute_tick_ms),
            reap_tick: Duration::from_millis(self.reap_tick_ms),
            monitor_tick: Duration::from_secs(self.monitor_tick_secs),
            liveness_secs: self.liveness_secs,
            batch_pull: self.batch_pull,
            durable: self.durable,
        }
    }

    pub fn worker_config(&self) -> crate::worker::WorkerConfig {
        crate::worker::WorkerConfig {
            pool_size: self.pool_size,
            heartbeat_tick: Duration::from_secs(self.heartbeat_secs),
            check_for_work_tick: Duration::from_millis(100),
            handoff_wait: Duration::from_millis(100),
        }
    }

    pub fn stealer_config(&self) -> crate::stealer::StealerConfig {
        crate::stealer::StealerConfig {
            tick: Duration::from_secs(self.steal_tick_secs),
        }
    }

    pub fn autoscaler_config(&self) -> crate::autoscaler::AutoscalerConfig {
        crate::autoscaler::AutoscalerConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            tick: Duration::from_secs(self.autoscale_tick_secs),
            cooldown_secs: self.autoscale_cooldown_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: 9090,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub log_path: String,
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            log_path: "logs/audit.log".to_string(),
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingSettings {
    pub default: RateLimitRule,
    pub endpoints: HashMap<String, RateLimitRule>,
}

impl Default for RateLimitingSettings {
    fn default() -> Self {
        Self {
            default: RateLimitRule::default(),
            endpoints: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitRule {
    pub requests: u32,
    pub window_seconds: u64,
    pub burst: u32,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            requests: 1000,
            window_seconds: 60,
            burst: 100,
        }
    }
}

