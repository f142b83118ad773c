use std::fmt;

/// How the orchestrator learns about server-side changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Notifications over the push channel
    Push,
    /// Fixed-interval pull
    Poll,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Push => write!(f, "push"),
            TransportMode::Poll => write!(f, "poll"),
        }
    }
}

/// Push only when the client can rely on push channels and has a connection to use
pub fn select_transport(push_available: bool, has_connection: bool) -> TransportMode {
    if push_available && has_connection {
        TransportMode::Push
    } else {
        TransportMode::Poll
    }
}
