//! HTTP exposition of the metrics registry for Prometheus scrapes

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::Metrics;

/// Content type of the Prometheus text format
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics)
}

async fn scrape(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], metrics.render())
}

/// Serve `/metrics` on `listener` until cancelled
pub async fn serve(metrics: Arc<Metrics>, listener: TcpListener, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "serving metrics");
    }

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "metrics server failed");
    }
}
