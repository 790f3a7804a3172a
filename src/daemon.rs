//! Health endpoint: liveness plus a live-connection gauge.

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::info;

use crate::connections::ConnectionManager;

/// Start the health check HTTP server.
pub async fn start_health_server(
    port: u16,
    connections: Arc<ConnectionManager>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(connections);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(
    State(connections): State<Arc<ConnectionManager>>,
) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": connections.connection_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSocket;

    #[tokio::test]
    async fn health_payload_reports_connection_gauge() {
        let connections = Arc::new(ConnectionManager::new());
        connections.register("c1", "t1", Arc::new(TestSocket::new()));

        let Json(body) = health_handler(State(connections)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["connections"], 1);
    }
}
