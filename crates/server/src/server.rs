//! Server lifecycle: bind, serve, shut down gracefully.

use std::future::Future;
use std::sync::Arc;

use kubelive_api::LiveApi;
use kubelive_hub::Hub;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

#[derive(Clone)]
pub struct LiveServer {
    state: Arc<AppState>,
}

impl LiveServer {
    #[must_use]
    pub fn new(config: ServerConfig, api: Arc<dyn LiveApi>, hub: Arc<Hub>) -> Self {
        Self { state: Arc::new(AppState::new(config, api, hub)) }
    }

    #[must_use]
    pub fn state(&self) -> Arc<AppState> { self.state.clone() }

    pub fn router(&self) -> axum::Router { create_router(self.state.clone()) }

    /// Serve until `shutdown` completes, then drain in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn serve_with_shutdown<F>(&self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config().bind_addr;
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::BindFailed(addr, e))?;
        let local = listener.local_addr().unwrap_or(addr);
        info!(addr = %local, "kubelive listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("kubelive server shut down");
        Ok(())
    }
}
