//! REST API server

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::engine::EngineHandle;
use crate::error::EngineResult;

/// REST API server over a running engine
pub struct RestApiServer {
    handle: EngineHandle,
}

impl RestApiServer {
    /// Wrap an engine handle
    pub fn new(handle: EngineHandle) -> Self {
        Self { handle }
    }

    /// Build the router: everything under `/api/v1`
    pub fn router(&self) -> Router {
        let api = Router::new()
            .route(
                "/wants",
                post(handlers::add_wants).get(handlers::list_wants),
            )
            .route(
                "/wants/:id",
                get(handlers::get_want)
                    .put(handlers::update_want)
                    .delete(handlers::delete_want),
            )
            .route("/wants/:id/status", get(handlers::get_status))
            .route("/wants/:id/results", get(handlers::get_results))
            .route("/wants/:id/:action", post(handlers::lifecycle))
            .route(
                "/agents",
                get(handlers::list_agents).post(handlers::register_agent),
            )
            .route(
                "/agents/:name",
                get(handlers::get_agent).delete(handlers::delete_agent),
            )
            .route(
                "/capabilities",
                get(handlers::list_capabilities).post(handlers::register_capability),
            )
            .route(
                "/capabilities/:name",
                get(handlers::get_capability).delete(handlers::delete_capability),
            )
            .route(
                "/recipes",
                get(handlers::list_recipes).post(handlers::register_recipe),
            )
            .route(
                "/recipes/:name",
                get(handlers::get_recipe).delete(handlers::delete_recipe),
            )
            .route(
                "/want-types",
                get(handlers::list_want_types).post(handlers::register_want_type),
            )
            .route(
                "/want-types/:name",
                get(handlers::get_want_type).delete(handlers::delete_want_type),
            )
            .route(
                "/errors",
                get(handlers::list_errors).delete(handlers::clear_errors),
            )
            .route("/health", get(handlers::health));

        let agent_service = Router::new()
            .route(
                "/agent-service/execute",
                post(handlers::agent_service_execute),
            )
            .route(
                "/agent-service/monitor/execute",
                post(handlers::agent_service_monitor_execute),
            )
            .route(
                "/agents/webhook/callback",
                post(handlers::webhook_callback),
            )
            .layer(middleware::from_fn_with_state(
                self.handle.clone(),
                handlers::require_agent_auth,
            ));

        Router::new()
            .nest("/api/v1", api.merge(agent_service))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.handle.clone())
    }

    /// Bind and serve until the process exits
    pub async fn serve(&self, addr: SocketAddr) -> EngineResult<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "REST API listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
