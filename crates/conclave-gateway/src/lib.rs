mod routes;
mod server;
mod state;

pub use routes::ApiError;
pub use server::GatewayServer;
pub use state::AppState;
