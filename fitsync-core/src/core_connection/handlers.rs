//! Caller callbacks and their isolation
//!
//! A handler that returns an error or panics is logged and counted; the
//! connection's own bookkeeping carries on regardless.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{error, warn};

use super::errors::ConnectionError;
use super::state::CloseReason;
use crate::metrics::{record_counter, CONNECTION_HANDLER_FAULTS};

/// Callbacks a connection owner can supply; every method defaults to a no-op
pub trait ConnectionHandlers: Send + Sync + 'static {
    fn on_open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Raw inbound text frame
    fn on_message(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&self, _error: &ConnectionError) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_close(&self, _reason: CloseReason) -> anyhow::Result<()> {
        Ok(())
    }

    /// A reconnect was scheduled
    fn on_reconnect(&self, _attempt: u32, _delay: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    /// The attempt ceiling was exceeded; the connection is now closed
    fn on_max_attempts(&self, _attempts: u32) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers that ignore everything
pub struct NoopHandlers;

impl ConnectionHandlers for NoopHandlers {}

/// Run one handler, swallowing failures
pub(crate) fn invoke<F>(handler: &'static str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            record_counter(CONNECTION_HANDLER_FAULTS, 1);
            warn!(handler, error = %e, "Connection handler failed");
        }
        Err(panic) => {
            record_counter(CONNECTION_HANDLER_FAULTS, 1);
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(handler, panic = %detail, "Connection handler panicked");
        }
    }
}
