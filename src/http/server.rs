//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{router, GuardState};
use crate::error::Result;

/// HTTP server for the guard service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// State shared by every handler
    state: GuardState,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, state: GuardState) -> Self {
        Self { addr, state }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server for the guard service"
        );

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apikey::{ApiKeyValidator, InMemoryApiKeyRepository};
    use crate::concurrency::ConcurrencyGuard;
    use crate::ratelimit::LimiterRegistry;
    use crate::store::{CounterStore, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let state = GuardState {
            limiters: Arc::new(LimiterRegistry::with_presets(Arc::clone(&store))),
            concurrency: Arc::new(ConcurrencyGuard::new(
                Arc::clone(&store),
                3,
                Duration::from_secs(60),
            )),
            api_keys: Arc::new(ApiKeyValidator::new(Arc::new(
                InMemoryApiKeyRepository::new(),
            ))),
            store,
        };

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, state);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
