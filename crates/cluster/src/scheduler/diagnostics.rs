//! `GET /diagnostics` over axum.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use stellwerk_wire::protocol::DiagnosticsSnapshot;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

/// Spawn the diagnostics HTTP server on the given port.
///
/// Serves the snapshot the scheduler loop last published, so requests never
/// wait on scheduling. Resolves when `shutdown` flips to `true`.
pub fn spawn_diagnostics_server(
    port: u16,
    snapshots: watch::Receiver<DiagnosticsSnapshot>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/diagnostics", get(diagnostics_handler))
            .layer(CorsLayer::permissive())
            .with_state(snapshots);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind diagnostics HTTP server");
                return;
            }
        };

        tracing::info!(port, "diagnostics HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("diagnostics HTTP server stopped");
    })
}

/// `GET /diagnostics` → JSON snapshot.
async fn diagnostics_handler(
    State(snapshots): State<watch::Receiver<DiagnosticsSnapshot>>,
) -> Json<DiagnosticsSnapshot> {
    Json(snapshots.borrow().clone())
}
