//! In-memory push transport with a scripted peer
//!
//! Each `open()` consumes the next [`OpenScript`] step (or the fallback).
//! Accepted sockets become numbered peers the test can feed, inspect and
//! drop.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core_connection::{
    CloseReason, ConnectionError, ConnectionHandlers, Inbound, Socket, Transport, TransportError,
};

/// What the next `open()` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenScript {
    Accept,
    Fail,
    /// Never completes; exercises the handshake timeout
    Hang,
}

struct Peer {
    to_client: Option<mpsc::UnboundedSender<Inbound>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

struct Script {
    steps: VecDeque<OpenScript>,
    fallback: OpenScript,
    peers: Vec<Peer>,
    opens: u32,
}

pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Accepts every connection
    pub fn new() -> Self {
        Self::with_fallback(OpenScript::Accept)
    }

    pub fn with_fallback(fallback: OpenScript) -> Self {
        Self {
            script: Mutex::new(Script { steps: VecDeque::new(), fallback, peers: Vec::new(), opens: 0 }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue explicit outcomes ahead of the fallback
    pub fn push_script(&self, steps: impl IntoIterator<Item = OpenScript>) {
        self.lock().steps.extend(steps);
    }

    pub fn set_fallback(&self, fallback: OpenScript) {
        self.lock().fallback = fallback;
    }

    /// Calls to `open()`, including failed and hung ones
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Accepted sockets so far
    pub fn peers(&self) -> usize {
        self.lock().peers.len()
    }

    fn deliver(&self, index: usize, frame: Inbound) -> bool {
        let script = self.lock();
        match script.peers.get(index).and_then(|p| p.to_client.as_ref()) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver a frame to the client on peer `index`
    pub fn push_to(&self, index: usize, text: &str) -> bool {
        self.deliver(index, Inbound::Text(text.to_string()))
    }

    /// Deliver a protocol-level keep-alive on peer `index`
    pub fn push_control(&self, index: usize) -> bool {
        self.deliver(index, Inbound::Control)
    }

    /// Deliver a frame on the most recently accepted peer
    pub fn push_latest(&self, text: &str) -> bool {
        let latest = self.peers().checked_sub(1);
        latest.map(|i| self.push_to(i, text)).unwrap_or(false)
    }

    /// End peer `index` as if the server hung up
    pub fn drop_peer(&self, index: usize) {
        if let Some(peer) = self.lock().peers.get_mut(index) {
            peer.to_client = None;
        }
    }

    /// Frames the client sent on peer `index`
    pub fn sent_by(&self, index: usize) -> Vec<String> {
        self.lock()
            .peers
            .get(index)
            .map(|p| p.sent.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    /// Whether the client closed peer `index`
    pub fn peer_closed(&self, index: usize) -> bool {
        self.lock().peers.get(index).map(|p| p.closed.load(Ordering::SeqCst)).unwrap_or(false)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self) -> Result<Box<dyn Socket>, TransportError> {
        let step = {
            let mut script = self.lock();
            script.opens += 1;
            let fallback = script.fallback;
            script.steps.pop_front().unwrap_or(fallback)
        };

        match step {
            OpenScript::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sent = Arc::new(Mutex::new(Vec::new()));
                let closed = Arc::new(AtomicBool::new(false));
                self.lock().peers.push(Peer {
                    to_client: Some(tx),
                    sent: sent.clone(),
                    closed: closed.clone(),
                });
                Ok(Box::new(ScriptedSocket { inbound: rx, sent, closed }))
            }
            OpenScript::Fail => Err(TransportError::Connect("scripted refusal".to_string())),
            OpenScript::Hang => std::future::pending::<Result<Box<dyn Socket>, TransportError>>().await,
        }
    }
}

struct ScriptedSocket {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Socket for ScriptedSocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Send("socket closed".to_string()));
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One observed handler call
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Open,
    Message(String),
    Error(String),
    Close(CloseReason),
    Reconnect(u32, Duration),
    MaxAttempts(u32),
}

/// Connection handlers that record every call
#[derive(Default)]
pub struct RecordingHandlers {
    events: Mutex<Vec<HandlerEvent>>,
}

impl RecordingHandlers {
    fn record(&self, event: HandlerEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        Ok(())
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, pred: impl Fn(&HandlerEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

impl ConnectionHandlers for RecordingHandlers {
    fn on_open(&self) -> anyhow::Result<()> {
        self.record(HandlerEvent::Open)
    }

    fn on_message(&self, text: &str) -> anyhow::Result<()> {
        self.record(HandlerEvent::Message(text.to_string()))
    }

    fn on_error(&self, error: &ConnectionError) -> anyhow::Result<()> {
        self.record(HandlerEvent::Error(error.to_string()))
    }

    fn on_close(&self, reason: CloseReason) -> anyhow::Result<()> {
        self.record(HandlerEvent::Close(reason))
    }

    fn on_reconnect(&self, attempt: u32, delay: Duration) -> anyhow::Result<()> {
        self.record(HandlerEvent::Reconnect(attempt, delay))
    }

    fn on_max_attempts(&self, attempts: u32) -> anyhow::Result<()> {
        self.record(HandlerEvent::MaxAttempts(attempts))
    }
}
