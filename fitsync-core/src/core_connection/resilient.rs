//! Self-healing push connection
//!
//! One background task owns the socket. It reconnects with [`Backoff`] after
//! unexpected closures, pings or recycles quiet sockets, and stops for good
//! after `close()` or once the attempt ceiling is exceeded. A later
//! `connect()` starts a fresh task with fresh accounting; state writes from a
//! superseded task are ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::{random_jitter, Backoff, BackoffStep, JitterSource};
use super::errors::ConnectionError;
use super::handlers::{invoke, ConnectionHandlers};
use super::heartbeat::{assess, Liveness};
use super::messages::PushMessage;
use super::state::{CloseReason, ConnectionState};
use super::transport::{Inbound, Socket, Transport, WsTransport};
use crate::config::ConnectionConfig;
use crate::metrics::{
    record_counter, CONNECTION_GAVE_UP, CONNECTION_OPENED, CONNECTION_PINGS, CONNECTION_RECONNECTS,
    CONNECTION_STALLS,
};

struct Session {
    stop: watch::Sender<bool>,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    session: Mutex<Option<Session>>,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) || *state == next {
                return false;
            }
            debug!(from = %state, to = %next, "Connection state change");
            *state = next;
            true
        });
    }

    fn set_outbound(&self, generation: u64, tx: Option<mpsc::UnboundedSender<String>>) {
        let mut guard = self.outbound();
        if self.is_current(generation) {
            *guard = tx;
        }
    }
}

/// Full-duplex push channel that survives flaky networks
pub struct ResilientConnection {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    jitter: JitterSource,
    shared: Arc<Shared>,
}

impl ResilientConnection {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            jitter: random_jitter(),
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
                session: Mutex::new(None),
            }),
        }
    }

    /// Connection to a WebSocket endpoint
    pub fn websocket(url: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::new(Arc::new(WsTransport::new(url)), config)
    }

    /// Replace the backoff jitter source
    pub fn with_jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start (or restart) the connection with fresh reconnect accounting
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, handlers: Arc<dyn ConnectionHandlers>) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);

        if let Some(previous) = self.shared.session().replace(Session { stop: stop_tx }) {
            previous.stop.send_replace(true);
        }
        *self.shared.outbound() = None;
        self.shared.set_state(generation, ConnectionState::Connecting);
        info!(generation, "Connecting push channel");

        let driver = Driver {
            transport: self.transport.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            handlers,
            stop: stop_rx,
            generation,
            backoff: Backoff::new(&self.config).with_jitter(self.jitter.clone()),
        };
        tokio::spawn(driver.run());
    }

    /// Queue a text frame; false if the channel is not open
    pub fn send(&self, payload: impl Into<String>) -> bool {
        if !self.state().is_open() {
            return false;
        }
        match self.shared.outbound().as_ref() {
            Some(tx) => tx.send(payload.into()).is_ok(),
            None => false,
        }
    }

    pub fn send_message(&self, message: &PushMessage) -> bool {
        self.send(message.to_json())
    }

    /// Close permanently; no reconnects until the next `connect()`
    pub fn close(&self) {
        *self.shared.outbound() = None;
        match self.shared.session().as_ref() {
            Some(session) => {
                // The task moves to Closed once the socket is torn down.
                self.shared.state.send_if_modified(|state| {
                    if state.is_terminal() {
                        return false;
                    }
                    *state = ConnectionState::Closing;
                    true
                });
                session.stop.send_replace(true);
            }
            None => {
                self.shared.state.send_replace(ConnectionState::Closed);
            }
        }
        info!("Push channel closed by caller");
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        if let Some(session) = self.shared.session().take() {
            session.stop.send_replace(true);
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = stop.wait_for(|stop| *stop).await;
}

struct Driver {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    handlers: Arc<dyn ConnectionHandlers>,
    stop: watch::Receiver<bool>,
    generation: u64,
    backoff: Backoff,
}

impl Driver {
    fn set_state(&self, state: ConnectionState) {
        self.shared.set_state(self.generation, state);
    }

    fn report(&self, error: ConnectionError) {
        let handlers = &self.handlers;
        invoke("on_error", || handlers.on_error(&error));
    }

    async fn run(mut self) {
        loop {
            if *self.stop.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connect_timeout = self.config.connect_timeout;
            let attempt = tokio::select! {
                result = timeout(connect_timeout, self.transport.open()) => result,
                _ = stopped(&mut self.stop) => break,
            };

            match attempt {
                Ok(Ok(mut socket)) => {
                    if *self.stop.borrow() {
                        let _ = socket.close().await;
                        break;
                    }
                    self.backoff.reset();
                    record_counter(CONNECTION_OPENED, 1);
                    if self.session(socket).await == CloseReason::Requested {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Connect attempt failed");
                    self.report(e.into());
                }
                Err(_) => {
                    warn!(timeout = ?connect_timeout, "Connect attempt timed out");
                    self.report(ConnectionError::ConnectTimeout(connect_timeout));
                }
            }

            self.set_state(ConnectionState::Disconnected);
            match self.backoff.next_step() {
                BackoffStep::GiveUp { attempts } => {
                    warn!(attempts, "Reconnect attempts exhausted, closing push channel");
                    record_counter(CONNECTION_GAVE_UP, 1);
                    self.set_state(ConnectionState::Closed);
                    let handlers = &self.handlers;
                    invoke("on_max_attempts", || handlers.on_max_attempts(attempts));
                    return;
                }
                BackoffStep::Retry { attempt, delay } => {
                    info!(attempt, delay = ?delay, "Scheduling reconnect");
                    record_counter(CONNECTION_RECONNECTS, 1);
                    let handlers = &self.handlers;
                    invoke("on_reconnect", || handlers.on_reconnect(attempt, delay));

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut self.stop) => break,
                    }
                }
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Drive one open socket until it ends
    async fn session(&mut self, mut socket: Box<dyn Socket>) -> CloseReason {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.shared.set_outbound(self.generation, Some(tx));
        self.set_state(ConnectionState::Open);

        let handlers = self.handlers.clone();
        invoke("on_open", || handlers.on_open());

        let ping_after = self.config.ping_after;
        let dead_after = self.config.dead_after;
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        let reason = loop {
            tokio::select! {
                inbound = socket.recv() => match inbound {
                    Some(Ok(Inbound::Text(text))) => {
                        last_inbound = Instant::now();
                        invoke("on_message", || handlers.on_message(&text));
                    }
                    Some(Ok(Inbound::Control)) => last_inbound = Instant::now(),
                    Some(Err(e)) => {
                        debug!(error = %e, "Push socket failed");
                        let error = ConnectionError::from(e);
                        invoke("on_error", || handlers.on_error(&error));
                        break CloseReason::Dropped;
                    }
                    None => {
                        debug!("Push socket closed by peer");
                        break CloseReason::Dropped;
                    }
                },
                Some(text) = rx.recv() => {
                    if let Err(e) = socket.send(text).await {
                        let error = ConnectionError::from(e);
                        invoke("on_error", || handlers.on_error(&error));
                        break CloseReason::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    let silence = last_inbound.elapsed();
                    match assess(silence, ping_after, dead_after) {
                        Liveness::Healthy => {}
                        Liveness::Ping => {
                            record_counter(CONNECTION_PINGS, 1);
                            debug!(silence = ?silence, "Sending keep-alive ping");
                            if let Err(e) = socket.send(PushMessage::ping_now().to_json()).await {
                                let error = ConnectionError::from(e);
                                invoke("on_error", || handlers.on_error(&error));
                                break CloseReason::Dropped;
                            }
                        }
                        Liveness::Dead => {
                            warn!(silence = ?silence, "Push socket stalled, forcing reconnect");
                            record_counter(CONNECTION_STALLS, 1);
                            let error = ConnectionError::Stalled(silence);
                            invoke("on_error", || handlers.on_error(&error));
                            break CloseReason::Stalled;
                        }
                    }
                }
                _ = stopped(&mut self.stop) => break CloseReason::Requested,
            }
        };

        self.shared.set_outbound(self.generation, None);
        if reason == CloseReason::Requested {
            self.set_state(ConnectionState::Closing);
        }
        match timeout(self.config.connect_timeout, socket.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Error while closing push socket"),
            Err(_) => debug!("Timed out closing push socket"),
        }
        invoke("on_close", || handlers.on_close(reason));
        reason
    }
}
