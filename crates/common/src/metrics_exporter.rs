//! Prometheus scrape endpoint for the dispatcher registry.
//!
//! Enabled with the `profiling` feature; `gqd-dispatch` starts it when
//! `GQD_METRICS_BIND` is set.

use std::io;
use std::net::SocketAddr;

use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use prometheus::TEXT_FORMAT;
use tokio::net::TcpListener;
use tracing::info;

use crate::metrics::global_metrics;

pub const METRICS_PATH: &str = "/metrics";

/// Bind `addr` and serve [`METRICS_PATH`] until the server stops.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, path = METRICS_PATH, "metrics exporter listening");
    serve_metrics_listener(listener).await
}

pub async fn serve_metrics_listener(listener: TcpListener) -> io::Result<()> {
    axum::serve(listener, metrics_router())
        .await
        .map_err(io::Error::other)
}

fn metrics_router() -> Router {
    Router::new().route(METRICS_PATH, get(scrape))
}

async fn scrape() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, TEXT_FORMAT)],
        global_metrics().render_prometheus(),
    )
}
