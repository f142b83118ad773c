//! Liveness decisions from inbound silence

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// Quiet for a while; send an application ping
    Ping,
    /// Quiet for too long; the socket is presumed dead
    Dead,
}

/// Classify a silence period against the ping and dead thresholds
pub fn assess(silence: Duration, ping_after: Duration, dead_after: Duration) -> Liveness {
    if silence > dead_after {
        Liveness::Dead
    } else if silence > ping_after {
        Liveness::Ping
    } else {
        Liveness::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_exclusive() {
        let ping = Duration::from_secs(30);
        let dead = Duration::from_secs(90);

        assert_eq!(assess(Duration::from_secs(30), ping, dead), Liveness::Healthy);
        assert_eq!(assess(Duration::from_secs(31), ping, dead), Liveness::Ping);
        assert_eq!(assess(Duration::from_secs(90), ping, dead), Liveness::Ping);
        assert_eq!(assess(Duration::from_secs(91), ping, dead), Liveness::Dead);
    }
}
