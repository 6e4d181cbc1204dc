//! HTTP API layer.
//!
//! Handlers are thin: every endpoint resolves to a controller call and a
//! JSON response. Router construction and server startup live here.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::ctrl::Controller;

pub mod http;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the TCP listener.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The accept loop failed.
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared application state for the API layer: a handle to the command
/// engine.
#[derive(Clone)]
pub struct AppState {
    pub ctrl: Arc<Controller>,
}

/// Starts the HTTP server on `addr` and serves until the process exits.
pub async fn start_server(addr: SocketAddr, ctrl: Arc<Controller>) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    log::info!("Server listening on http://{}", addr);
    let app = http::create_router(AppState { ctrl });
    axum::serve(listener, app).await?;
    Ok(())
}
