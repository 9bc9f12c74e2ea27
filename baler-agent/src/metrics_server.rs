//! Prometheus text-format endpoint.

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn serve(addr: SocketAddr, ctx: CancellationToken) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_text));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("serving metrics on http://{addr}/metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(ctx.cancelled_owned())
        .await?;
    Ok(())
}

async fn metrics_text() -> Result<String, (StatusCode, String)> {
    prometheus::TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}
