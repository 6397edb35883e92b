use conclave_agent::Conclave;
use conclave_core::config::GatewayConfig;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub app: Conclave,
}
