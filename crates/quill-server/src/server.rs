use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes::{self, AppState};
use crate::sse;

pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 4096 }
    }
}

/// Build the router exposing the session engine to external collaborators.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/path", get(routes::get_path))
        .route("/project", get(routes::list_projects))
        .route("/project/current", get(routes::current_project))
        .route("/project/{id}/update", post(routes::update_project))
        .route("/session", get(routes::list_sessions).post(routes::create_session))
        .route(
            "/session/{id}",
            get(routes::get_session).delete(routes::delete_session),
        )
        .route("/session/{id}/share", post(routes::share_session))
        .route("/session/{id}/unshare", post(routes::unshare_session))
        .route("/session/{id}/abort", post(routes::abort_session))
        .route("/session/{id}/prompt", post(routes::prompt_session))
        .route("/session/{id}/message", get(routes::list_messages))
        .route("/session/{id}/message/{mid}/part", get(routes::list_parts))
        .route(
            "/session/{id}/permission/{pid}",
            post(routes::reply_permission),
        )
        .route("/event", get(sse::event_stream))
        .route("/file", get(routes::get_file))
        .route("/find/files", get(routes::find_files))
        .route("/instance/dispose", post(routes::dispose))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle carrying the bound port and the shutdown
/// signal.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    let port = listener.local_addr()?.port();

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.cancelled().await;
            })
            .await
            .ok();
    });

    info!(port, "quill server started");
    Ok(ServerHandle {
        port,
        shutdown,
        server,
    })
}

/// Keeps the serve task alive; `shutdown()` then `drain()` for a clean stop.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections; in-flight requests run to completion.
    pub fn shutdown(&self) {
        info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    /// Wait for the serve task after `shutdown()`.
    pub async fn drain(self) {
        let _ = self.server.await;
    }
}
