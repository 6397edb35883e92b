use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use conclave_agent::Conclave;
use conclave_core::config::GatewayConfig;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    app: Conclave,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, app: Conclave) -> Self {
        Self { config, app }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            app: self.app.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Agents
            .route("/api/agents", get(routes::list_agents).post(routes::create_agent))
            .route(
                "/api/agents/{id}",
                get(routes::get_agent).delete(routes::delete_agent),
            )
            .route("/api/agents/{id}/launch", post(routes::launch_agent))
            .route("/api/agents/{id}/stop", post(routes::stop_agent))
            .route("/api/agents/{id}/logs", get(routes::agent_logs))
            // Coordination tools
            .route("/api/tools/{agent_id}", post(routes::call_tool))
            // Workflows
            .route(
                "/api/workflows",
                get(routes::list_workflows).post(routes::create_workflow),
            )
            .route(
                "/api/workflows/{id}",
                get(routes::get_workflow).delete(routes::delete_workflow),
            )
            .route("/api/workflows/{id}/run", post(routes::run_workflow))
            .route("/api/workflows/{id}/runs", get(routes::list_runs))
            .route("/api/runs/{id}", get(routes::get_run))
            // Webhooks
            .route("/api/hooks/workflows/{id}", post(routes::workflow_webhook))
            // Teams
            .route("/api/teams", get(routes::list_teams).post(routes::create_team))
            .route("/api/teams/{id}/status", get(routes::team_status))
            .route("/api/teams/{id}/start", post(routes::start_team))
            .route("/api/teams/{id}/stop", post(routes::stop_team))
            // Events and traces
            .route("/api/events", get(routes::list_events))
            .route("/api/traces", get(routes::list_traces))
            .route("/api/traces/{id}", get(routes::get_trace))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
