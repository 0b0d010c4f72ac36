//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::{MetricsBuffer, Store};
use crate::scheduler::SummaryFlushJob;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub buffer: Arc<dyn MetricsBuffer>,
    pub flush: Arc<SummaryFlushJob>,
}

/// Web server exposing sites and pipeline status.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        buffer: Arc<dyn MetricsBuffer>,
        flush: Arc<SummaryFlushJob>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                buffer,
                flush,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_healthz))
            // API endpoints
            .route(
                "/api/sites",
                get(handlers::handle_get_sites).post(handlers::handle_create_site),
            )
            .route(
                "/api/sites/{id}",
                get(handlers::handle_get_site)
                    .put(handlers::handle_update_site)
                    .delete(handlers::handle_delete_site),
            )
            .route("/api/status", get(handlers::handle_status))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
