//! kubelive HTTP surface.
//!
//! Per-kind snapshot queries, the scale and pod-delete mutations, and the `/ws` realtime
//! endpoint that attaches each connection to the broadcast hub.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;
pub mod websocket;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use routes::create_router;
pub use server::LiveServer;
pub use state::AppState;
