//! Composes one [`Worker`] with its optional [`Stealer`]/[`Autoscaler`]
//! sidecars under a shared cancellation token. Shared by the CLI's
//! `run --role=worker` foreground worker and the admin API's
//! dynamically started ones ([`crate::admin::WorkerRegistry`]).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::autoscaler::{Autoscaler, AutoscalerConfig};
use crate::stealer::{Stealer, StealerConfig};
use crate::worker::Worker;

/// Runs the worker's four loops plus its optional stealer and autoscaler
/// until `token` is cancelled, then waits for all of them to finish
/// draining before returning.
pub async fn run(worker: Arc<Worker>, token: CancellationToken, enable_steal: bool, autoscaler_config: AutoscalerConfig) {
    let child = token.child_token();

    let worker_task = {
        let worker = worker.clone();
        let child = child.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.run(child).await {
                error!(error = %err, "worker loop exited with error");
            }
        })
    };

    let stealer_task = enable_steal.then(|| {
        let stealer = Stealer::new(worker.clone(), StealerConfig::default());
        let child = child.clone();
        tokio::spawn(async move { stealer.run(child).await })
    });

    let autoscaler_task = {
        let autoscaler = Autoscaler::new(worker.clone(), autoscaler_config);
        let child = child.clone();
        tokio::spawn(async move { autoscaler.run(child).await })
    };

    token.cancelled().await;
    let _ = worker_task.await;
    if let Some(handle) = stealer_task {
        let _ = handle.await;
    }
    let _ = autoscaler_task.await;
}
