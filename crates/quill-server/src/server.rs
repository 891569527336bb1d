use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use quill_core::conversation::ConversationStore;
use quill_engine::AgentRunner;

use crate::config::ServerConfig;
use crate::handlers;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<AgentRunner>,
    pub store: Arc<dyn ConversationStore>,
    pub config: Arc<ServerConfig>,
    /// Cancelled on shutdown; every run holds a child token.
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/invoke", post(handlers::invoke))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns once the listener is up.
pub async fn start(
    config: ServerConfig,
    runner: Arc<AgentRunner>,
    store: Arc<dyn ConversationStore>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;

    let state = AppState {
        runner,
        store,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    tracing::info!(addr = %local_addr, "quill server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Cancel in-flight runs, stop accepting connections and wait for the
    /// server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task failed");
        }
    }
}
