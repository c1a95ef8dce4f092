//! Internal Prometheus scrape endpoint, separate from the admin
//! API's `/api/metrics` JSON shape. Registered as a [`ServiceRegistration`]
//! alongside the admin HTTP surface and the coordinator/worker loops so it
//! shares their shutdown token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::config::ObservabilitySettings;
use crate::platform::context::PlatformContext;
use crate::platform::service::ServiceRegistration;

pub fn telemetry_service(settings: ObservabilitySettings) -> ServiceRegistration {
    ServiceRegistration::new(
        "telemetry",
        Arc::new(move |ctx, token: CancellationToken| {
            let settings = settings.clone();
            tokio::spawn(async move {
                if !settings.enable_metrics {
                    return Ok(());
                }

                let app = Router::new()
                    .route("/metrics", get(metrics_handler))
                    .with_state(ctx);
                let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
                let shutdown = token.clone();

                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!(port = settings.metrics_port, "telemetry server started");

                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                        info!("shutting down telemetry server");
                    })
                    .await?;

                Ok::<(), anyhow::Error>(())
            })
        }),
    )
}

async fn metrics_handler(State(ctx): State<PlatformContext>) -> Result<String, axum::http::StatusCode> {
    let snapshot = ctx
        .metrics()
        .snapshot()
        .await
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(crate::metrics::render_prometheus(&snapshot))
}
