//! Harness HTTP server

use super::api::build_router;
use super::backend::InMemoryBackend;
use super::state::AppState;
use anyhow::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Serves an [`InMemoryBackend`] over HTTP and WebSocket
pub struct HarnessServer {
    state: Arc<AppState>,
    addr: String,
}

impl HarnessServer {
    pub fn new(backend: Arc<InMemoryBackend>, addr: impl Into<String>) -> Self {
        Self { state: Arc::new(AppState::new(backend)), addr: addr.into() }
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %listener.local_addr()?, "Harness listening");

        axum::serve(listener, build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Bind an ephemeral loopback port and serve in the background
    pub async fn spawn(backend: Arc<InMemoryBackend>) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(Arc::new(AppState::new(backend)));

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Harness server stopped");
            }
        });
        Ok((addr, handle))
    }
}

/// Serve a fresh in-memory backend at `addr` until ctrl-c
pub async fn start_server(addr: impl Into<String>) -> Result<()> {
    let server = HarnessServer::new(Arc::new(InMemoryBackend::new()), addr);
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
