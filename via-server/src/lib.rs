//! via-server - HTTP server and detection loop for the Vector Incident Atlas
//!
//! Owns the component graph: ingest coordinator, Tier-1 rhythm monitor,
//! promotion pipeline, Tier-2 forensic store, federated query layer, and the
//! background workers. The CLI binary is a thin wrapper around [`ViaServer`].

mod error;
pub mod federation;
pub mod forensic;
pub mod http;
pub mod ingest;
pub mod promote;
mod state;
pub mod tier1;
pub mod worker;

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use via_core::config::ViaConfig;
use via_core::error::{ConfigError, ViaError};
use via_core::vector::{MemoryBackend, VectorBackend};

pub use error::ApiError;
pub use http::create_router;
pub use state::AppState;

/// Errors from the serve loop itself.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// The VIA daemon.
pub struct ViaServer {
    state: Arc<AppState>,
}

impl ViaServer {
    /// Build the backend from configuration, verify it is reachable, and
    /// wire the state graph.
    pub async fn initialize(config: ViaConfig) -> Result<Self, ViaError> {
        let backend = build_backend(&config)?;
        backend.ping().await?;
        Ok(Self {
            state: AppState::initialize(config, backend).await?,
        })
    }

    /// Wire the state graph over an injected backend (tests, embedding).
    pub async fn with_backend(
        config: ViaConfig,
        backend: Arc<dyn VectorBackend>,
    ) -> Result<Self, ViaError> {
        backend.ping().await?;
        Ok(Self {
            state: AppState::initialize(config, backend).await?,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<(), ServeError> {
        let addr = self.state.config.bind_addr.clone();
        let listener = TcpListener::bind(&addr).await.map_err(|e| ServeError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        tracing::info!(%addr, "via server listening");
        self.run_with_listener(listener).await
    }

    /// Serve on an existing listener (tests bind port 0 themselves).
    pub async fn run_with_listener(self, listener: TcpListener) -> Result<(), ServeError> {
        let handles = worker::spawn_background_tasks(self.state.clone());
        let router = http::create_router(self.state);
        let result = axum::serve(listener, router).await;
        for handle in handles {
            handle.abort();
        }
        result?;
        Ok(())
    }
}

fn build_backend(config: &ViaConfig) -> Result<Arc<dyn VectorBackend>, ViaError> {
    if config.uses_memory_backend() {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    // Remote engines plug in through `ViaServer::with_backend`; nothing else
    // is compiled in.
    Err(ConfigError::InvalidValue {
        key: "VECTOR_BACKEND_URL",
        value: config.vector_backend_url.clone(),
        reason: "only the in-process engine (`memory:`) is built in".to_string(),
    }
    .into())
}
