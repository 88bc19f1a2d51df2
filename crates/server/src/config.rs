//! HTTP server configuration.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Interval between WebSocket ping frames.
    pub ws_ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)), ws_ping_interval: Duration::from_secs(30) }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self { Self { bind_addr, ..Self::default() } }

    #[must_use]
    pub const fn with_ws_ping_interval(mut self, interval: Duration) -> Self {
        self.ws_ping_interval = interval;
        self
    }
}
