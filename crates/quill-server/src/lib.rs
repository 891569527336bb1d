pub mod config;
pub mod handlers;
pub mod server;
pub mod transport;

pub use config::ServerConfig;
pub use server::{build_router, start, AppState, ServerHandle};
pub use transport::{HttpStreamTransport, PendingResponse};
