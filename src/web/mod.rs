//! HTTP server: signaling WebSockets, health checks and the static client

pub mod shared;
pub use shared::SharedState;

pub mod http_server;
pub use http_server::{build_router, run_http_server};
