//! Socket seam
//!
//! The connection needs text frames in both directions, plus a signal for
//! protocol-level keep-alives so they count as liveness. Production uses
//! WebSocket; tests script the peer in memory.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::errors::TransportError;

/// Opens sockets to one fixed endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn Socket>, TransportError>;
}

/// What arrived on a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Transport keep-alive with no payload for the application
    Control,
}

/// One open full-duplex text channel
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame; `None` once the peer has closed
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsSocket { stream }))
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text))),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Inbound::Text(text))),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // tungstenite answers pings itself; the frame still proves the peer is alive.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Some(Ok(Inbound::Control)),
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
