//! Liveness endpoint served alongside the worker loop

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Service name reported by `/healthz`
pub const SERVICE_NAME: &str = "resolver";

/// Default bind address for the health listener
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8000";

pub fn router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "service": SERVICE_NAME}))
}

/// Serve [`router`] on `listener` until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Health endpoint listening");
    }

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
