//! Metrics for the sync core
//!
//! Everything goes through the `metrics` facade. Nothing is recorded unless the
//! host process installs a recorder (the CLI can install a Prometheus one).

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const CONNECTION_OPENED: &str = "connection.opened";
pub const CONNECTION_RECONNECTS: &str = "connection.reconnects";
pub const CONNECTION_GAVE_UP: &str = "connection.gave_up";
pub const CONNECTION_PINGS: &str = "connection.pings";
pub const CONNECTION_STALLS: &str = "connection.stalls";
pub const CONNECTION_HANDLER_FAULTS: &str = "connection.handler_faults";

pub const RESYNC_COMPLETED: &str = "sync.resync.completed";
pub const RESYNC_SKIPPED: &str = "sync.resync.skipped";
pub const RESYNC_FAILED: &str = "sync.resync.failed";
pub const RESYNC_DURATION_MS: &str = "sync.resync.duration_ms";
pub const RESYNC_VIRTUAL_GROUPS: &str = "sync.resync.virtual_groups";
pub const RESYNC_ROSTER_FAILURES: &str = "sync.resync.roster_failures";
pub const STORE_GROUPS: &str = "store.groups";

pub const MUTATION_COMMITTED: &str = "store.mutation.committed";
pub const MUTATION_ROLLED_BACK: &str = "store.mutation.rolled_back";

pub const SYNC_PUSH_UPDATES: &str = "sync.push.updates";
pub const SYNC_TRIGGERED: &str = "sync.triggered";

pub const IDS_REFRESHED: &str = "ids.refreshed";
pub const IDS_REFRESH_FAILED: &str = "ids.refresh_failed";

/// Register metric descriptions with the installed recorder
pub fn init_metrics() {
    describe_counter!(CONNECTION_OPENED, "Push channel sockets successfully opened");
    describe_counter!(CONNECTION_RECONNECTS, "Reconnects scheduled after unexpected closure");
    describe_counter!(CONNECTION_GAVE_UP, "Times the attempt ceiling closed the connection");
    describe_counter!(CONNECTION_PINGS, "Keep-alive pings sent after inbound silence");
    describe_counter!(CONNECTION_STALLS, "Connections torn down for exceeding the silence limit");
    describe_counter!(CONNECTION_HANDLER_FAULTS, "Caller handlers that failed or panicked");

    describe_counter!(RESYNC_COMPLETED, "Completed resync passes");
    describe_counter!(RESYNC_SKIPPED, "Resyncs skipped because one was in flight");
    describe_counter!(RESYNC_FAILED, "Resyncs aborted by a backend failure");
    describe_histogram!(RESYNC_DURATION_MS, "Resync duration in milliseconds");
    describe_gauge!(RESYNC_VIRTUAL_GROUPS, "Virtual groups synthesized by the last resync");
    describe_counter!(RESYNC_ROSTER_FAILURES, "Roster fetches that degraded to empty");
    describe_gauge!(STORE_GROUPS, "Groups held by the store after the last resync");

    describe_counter!(MUTATION_COMMITTED, "Optimistic mutations confirmed by the server");
    describe_counter!(MUTATION_ROLLED_BACK, "Optimistic mutations rolled back after failure");

    describe_counter!(SYNC_PUSH_UPDATES, "Group update notifications received on the push channel");
    describe_counter!(SYNC_TRIGGERED, "Resyncs started by the orchestrator");

    describe_counter!(IDS_REFRESHED, "Identifier table refreshes");
    describe_counter!(IDS_REFRESH_FAILED, "Identifier table refreshes that failed");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now() }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) -> f64 {
        let ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.name).record(ms);
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        // No recorder installed: describing and recording must be no-ops.
        init_metrics();
        record_counter(RESYNC_COMPLETED, 1);
        record_gauge(STORE_GROUPS, 3.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new(RESYNC_DURATION_MS);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 5.0);
    }
}
