//! Shared state for request handlers.

use std::sync::Arc;
use std::time::Instant;

use kubelive_api::LiveApi;
use kubelive_hub::Hub;

use crate::config::ServerConfig;

pub struct AppState {
    config: ServerConfig,
    api: Arc<dyn LiveApi>,
    hub: Arc<Hub>,
    start_time: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, api: Arc<dyn LiveApi>, hub: Arc<Hub>) -> Self {
        Self { config, api, hub, start_time: Instant::now() }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig { &self.config }

    #[must_use]
    pub fn api(&self) -> &dyn LiveApi { self.api.as_ref() }

    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> { &self.hub }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 { self.start_time.elapsed().as_secs() }
}
