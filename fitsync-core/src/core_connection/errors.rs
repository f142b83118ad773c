//! Connection error types

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`Transport`](super::Transport) or its sockets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

/// Faults observed by the connection; passed to `on_error`, never returned
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("No inbound traffic for {0:?}")]
    Stalled(Duration),
}
