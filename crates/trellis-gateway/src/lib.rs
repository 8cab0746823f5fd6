pub mod auth;
pub mod connection;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use server::GatewayServer;
pub use state::AppState;
