pub mod config;
pub mod context;
pub mod runtime;
pub mod service;
pub mod telemetry;

pub use config::MeshConfig;
pub use context::PlatformContext;
pub use runtime::{run_coordinator, run_worker, Platform, PlatformRuntime};
pub use service::ServiceRegistration;
