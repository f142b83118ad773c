//! Async test helpers
//!
//! Waiting on watch channels and letting background tasks run under a paused
//! clock.

use std::future::Future;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

/// Default timeout duration for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Let spawned tasks run until they park
///
/// Under a paused clock this advances virtual time by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait until a watched value satisfies `pred`, panicking after `limit`
pub async fn wait_until<T, F>(rx: &mut watch::Receiver<T>, limit: Duration, mut pred: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    match timeout(limit, rx.wait_for(|v| pred(v))).await {
        Ok(Ok(value)) => value.clone(),
        Ok(Err(_)) => panic!("watch channel closed before condition held"),
        Err(_) => panic!("condition not reached within {:?}", limit),
    }
}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}
