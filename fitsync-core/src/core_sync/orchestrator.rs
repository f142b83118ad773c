//! Keeps the group store fresh
//!
//! Push mode relays `group_update` notifications from the resilient
//! connection into debounced resyncs and pulls once whenever the channel opens
//! or drops; poll mode resyncs on a fixed interval.
//! A coarse safety-net timer runs in both modes. Every loop is registered with
//! the shutdown coordinator so `stop()` can join it.

use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::mode::{select_transport, TransportMode};
use crate::config::{FeatureManager, SyncConfig};
use crate::core_connection::{CloseReason, ConnectionHandlers, PushMessage, ResilientConnection};
use crate::core_groups::{GroupStore, ResyncOptions, ResyncOutcome, SyncError, SyncResult};
use crate::metrics::{record_counter, SYNC_PUSH_UPDATES, SYNC_TRIGGERED};
use crate::shutdown::{ShutdownCoordinator, ShutdownListener};

/// Events the push relay forwards to the trigger loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Opened,
    Update,
    Closed(CloseReason),
    GaveUp(u32),
}

/// Connection handlers that turn socket events into triggers
struct PushRelay {
    triggers: mpsc::UnboundedSender<Trigger>,
}

impl PushRelay {
    fn relay(&self, trigger: Trigger) -> anyhow::Result<()> {
        self.triggers
            .send(trigger)
            .map_err(|_| anyhow::anyhow!("sync trigger loop has stopped"))
    }
}

impl ConnectionHandlers for PushRelay {
    fn on_open(&self) -> anyhow::Result<()> {
        self.relay(Trigger::Opened)
    }

    fn on_message(&self, text: &str) -> anyhow::Result<()> {
        match PushMessage::parse(text) {
            Some(message) if message.is_group_update() => {
                record_counter(SYNC_PUSH_UPDATES, 1);
                self.relay(Trigger::Update)
            }
            Some(_) => Ok(()),
            None => {
                debug!(len = text.len(), "Ignoring unparseable push frame");
                Ok(())
            }
        }
    }

    fn on_close(&self, reason: CloseReason) -> anyhow::Result<()> {
        if reason == CloseReason::Requested {
            return Ok(());
        }
        self.relay(Trigger::Closed(reason))
    }

    fn on_max_attempts(&self, attempts: u32) -> anyhow::Result<()> {
        self.relay(Trigger::GaveUp(attempts))
    }
}

pub struct SyncOrchestrator {
    store: Arc<GroupStore>,
    connection: Option<Arc<ResilientConnection>>,
    features: FeatureManager,
    config: SyncConfig,
    shutdown: Arc<ShutdownCoordinator>,
    mode: Mutex<Option<TransportMode>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<GroupStore>,
        connection: Option<Arc<ResilientConnection>>,
        features: FeatureManager,
        config: SyncConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self { store, connection, features, config, shutdown, mode: Mutex::new(None) }
    }

    /// Transport chosen by `start()`, if started
    pub fn mode(&self) -> Option<TransportMode> {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn store(&self) -> &Arc<GroupStore> {
        &self.store
    }

    /// Refresh identifiers once, then start the background loops
    pub async fn start(&self) -> SyncResult<TransportMode> {
        let mode = select_transport(self.features.push_channels_available(), self.connection.is_some());
        {
            let mut current = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                return Err(SyncError::Internal("sync orchestrator already started".to_string()));
            }
            if self.shutdown.is_shutting_down() {
                return Err(SyncError::Internal("sync orchestrator was stopped".to_string()));
            }
            *current = Some(mode);
        }
        info!(mode = %mode, "Starting sync orchestrator");

        let ids = self.store.ids();
        match ids.refresh(self.store.api().as_ref()).await {
            Ok(mappings) => debug!(mappings, "Initial identifier refresh done"),
            Err(e) => warn!(error = %e, "Initial identifier refresh failed"),
        }

        match (mode, &self.connection) {
            (TransportMode::Push, Some(connection)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                connection.connect(Arc::new(PushRelay { triggers: tx }));
                let task = tokio::spawn(push_loop(
                    self.store.clone(),
                    connection.clone(),
                    rx,
                    self.config.clone(),
                    self.shutdown.listener(),
                ));
                self.shutdown.register("push-trigger", task);
            }
            _ => {
                let task = tokio::spawn(periodic(
                    self.store.clone(),
                    self.config.poll_interval,
                    "poll",
                    self.shutdown.listener(),
                ));
                self.shutdown.register("poll", task);
            }
        }

        let task = tokio::spawn(periodic(
            self.store.clone(),
            self.config.safety_net_interval,
            "safety-net",
            self.shutdown.listener(),
        ));
        self.shutdown.register("safety-net", task);

        Ok(mode)
    }

    /// Close the push channel and stop every loop
    pub async fn stop(&self) {
        info!("Stopping sync orchestrator");
        if let Some(connection) = &self.connection {
            connection.close();
        }
        self.shutdown.shutdown().await;
    }
}

async fn run_resync(store: &GroupStore, source: &'static str) {
    record_counter(SYNC_TRIGGERED, 1);
    match store.resync(ResyncOptions::default()).await {
        Ok(ResyncOutcome::Completed(report)) => {
            debug!(source, groups = report.groups, virtual_groups = report.virtual_groups, "Triggered resync done")
        }
        Ok(ResyncOutcome::Skipped) => debug!(source, "Triggered resync skipped"),
        Err(e) => warn!(source, error = %e, "Triggered resync failed"),
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn periodic(store: Arc<GroupStore>, period: Duration, source: &'static str, mut shutdown: ShutdownListener) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => run_resync(&store, source).await,
        }
    }
    debug!(source, "Sync loop stopped");
}

async fn push_loop(
    store: Arc<GroupStore>,
    connection: Arc<ResilientConnection>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    config: SyncConfig,
    mut shutdown: ShutdownListener,
) {
    let debounce = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(debounce);
    let mut armed = false;
    let mut relay_open = true;
    // Pull cadence once the connection has given up.
    let mut fallback: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            trigger = triggers.recv(), if relay_open => match trigger {
                Some(Trigger::Opened) => {
                    if connection.send_message(&PushMessage::subscribe_groups()) {
                        debug!("Subscribed to group updates");
                    } else {
                        warn!("Push channel closed before the subscription was sent");
                    }
                    // Changes made while the channel was down produced no update.
                    run_resync(&store, "push-open").await;
                }
                Some(Trigger::Update) => {
                    debounce.as_mut().reset(Instant::now() + config.push_debounce);
                    armed = true;
                }
                Some(Trigger::Closed(reason)) => {
                    debug!(?reason, "Push channel closed, pulling once");
                    run_resync(&store, "push-closed").await;
                }
                Some(Trigger::GaveUp(attempts)) => {
                    // The connection stays closed until someone calls connect() again.
                    warn!(attempts, interval = ?config.poll_interval, "Push channel gave up, polling instead");
                    fallback = Some(ticker(config.poll_interval));
                }
                None => {
                    relay_open = false;
                    if fallback.is_none() && !armed {
                        break;
                    }
                }
            },
            _ = &mut debounce, if armed => {
                armed = false;
                run_resync(&store, "push").await;
                if !relay_open && fallback.is_none() {
                    break;
                }
            }
            _ = next_tick(&mut fallback) => run_resync(&store, "poll-fallback").await,
        }
    }
    debug!("Push trigger loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, FeatureFlags};
    use crate::core_connection::ConnectionState;
    use crate::core_groups::GroupId;
    use crate::test_utils::{fixed_jitter, settle, OpenScript, ScriptedTransport, StoreFixture, TestGroupBuilder};

    const UPDATE: &str = r#"{"type":"group_update","groupId":1}"#;

    fn coordinator() -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)))
    }

    fn poll_only() -> FeatureManager {
        FeatureManager::with_flags(FeatureFlags { push_channels: false, ..FeatureFlags::default() })
    }

    fn push_connection(transport: Arc<ScriptedTransport>, config: ConnectionConfig) -> Arc<ResilientConnection> {
        Arc::new(ResilientConnection::new(transport, config).with_jitter(fixed_jitter(0.0)))
    }

    fn push_orchestrator(fx: &StoreFixture, connection: Arc<ResilientConnection>) -> SyncOrchestrator {
        SyncOrchestrator::new(
            fx.store.clone(),
            Some(connection),
            FeatureManager::new(),
            SyncConfig::default(),
            coordinator(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode_resyncs_on_interval() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());
        let sync = SyncOrchestrator::new(fx.store.clone(), None, poll_only(), SyncConfig::default(), coordinator());

        assert_eq!(sync.start().await.unwrap(), TransportMode::Poll);
        assert_eq!(sync.mode(), Some(TransportMode::Poll));
        assert_eq!(fx.backend.calls("fetch_identifiers"), 1);
        assert_eq!(fx.backend.calls("list_groups"), 0);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(fx.backend.calls("list_groups"), 1);
        assert_eq!(fx.store.len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);

        sync.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_connection_falls_back_to_poll() {
        let fx = StoreFixture::new();
        let sync = SyncOrchestrator::new(fx.store.clone(), None, FeatureManager::new(), SyncConfig::default(), coordinator());
        assert_eq!(sync.start().await.unwrap(), TransportMode::Poll);
        sync.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_net_runs_alongside_push() {
        let fx = StoreFixture::new();
        let transport = Arc::new(ScriptedTransport::new());
        let sync = push_orchestrator(&fx, push_connection(transport.clone(), ConnectionConfig::default()));
        sync.start().await.unwrap();
        settle().await;
        assert_eq!(fx.backend.calls("list_groups"), 1);

        tokio::time::sleep(Duration::from_secs(58)).await;
        assert_eq!(fx.backend.calls("list_groups"), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
        sync.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_subscribes_and_debounces_updates() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());
        let transport = Arc::new(ScriptedTransport::new());
        let sync = push_orchestrator(&fx, push_connection(transport.clone(), ConnectionConfig::default()));

        assert_eq!(sync.start().await.unwrap(), TransportMode::Push);
        settle().await;
        assert_eq!(transport.sent_by(0), vec![PushMessage::subscribe_groups().to_json()]);
        assert_eq!(fx.backend.calls("list_groups"), 1);
        assert_eq!(fx.store.len(), 1);

        fx.backend.insert_group(TestGroupBuilder::new(2, 1).build());
        for _ in 0..3 {
            assert!(transport.push_latest(UPDATE));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(transport.push_latest(r#"{"type":"presence"}"#));
        assert_eq!(fx.backend.calls("list_groups"), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
        assert_eq!(fx.store.len(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
        sync.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_closure_and_reopen_each_pull() {
        let fx = StoreFixture::new();
        let transport = Arc::new(ScriptedTransport::new());
        let connection = push_connection(transport.clone(), ConnectionConfig::default());
        let sync = push_orchestrator(&fx, connection.clone());
        sync.start().await.unwrap();
        settle().await;
        assert_eq!(fx.backend.calls("list_groups"), 1);

        transport.drop_peer(0);
        settle().await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
        assert_eq!(transport.opens(), 1);

        // Nobody is subscribed while the channel is down, so no update is sent.
        fx.backend.insert_group(TestGroupBuilder::new(42, 3).build());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(transport.sent_by(1), vec![PushMessage::subscribe_groups().to_json()]);
        assert_eq!(fx.backend.calls("list_groups"), 3);
        assert!(fx.store.get(GroupId(42)).is_some());
        sync.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_push_channel_switches_to_polling() {
        let fx = StoreFixture::new();
        let transport = Arc::new(ScriptedTransport::with_fallback(OpenScript::Fail));
        let config = ConnectionConfig { max_attempts: 1, ..ConnectionConfig::default() };
        let connection = push_connection(transport.clone(), config);
        let sync = push_orchestrator(&fx, connection.clone());
        sync.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(fx.backend.calls("list_groups"), 0);

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert_eq!(fx.backend.calls("list_groups"), 1);

        // Nothing reconnects the channel, so polling carries on.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.backend.calls("list_groups"), 2);
        assert_eq!(transport.opens(), 2);
        assert_eq!(connection.state(), ConnectionState::Closed);
        sync.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_connection_without_pulling() {
        let fx = StoreFixture::new();
        let transport = Arc::new(ScriptedTransport::new());
        let connection = push_connection(transport.clone(), ConnectionConfig::default());
        let sync = push_orchestrator(&fx, connection.clone());
        sync.start().await.unwrap();
        settle().await;
        assert_eq!(fx.backend.calls("list_groups"), 1);

        sync.stop().await;
        settle().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(transport.peer_closed(0));
        assert_eq!(fx.backend.calls("list_groups"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let fx = StoreFixture::new();
        let sync = SyncOrchestrator::new(fx.store.clone(), None, poll_only(), SyncConfig::default(), coordinator());
        sync.start().await.unwrap();
        assert!(matches!(sync.start().await, Err(SyncError::Internal(_))));

        sync.stop().await;
        assert!(matches!(sync.start().await, Err(SyncError::Internal(_))));
        assert_eq!(fx.backend.calls("fetch_identifiers"), 1);
    }
}
