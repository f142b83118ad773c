//! Resilient push connection
//!
//! A single logical channel to the server's push endpoint: heartbeat-based
//! liveness, bounded exponential backoff with jitter, and a terminal closed
//! state that only an explicit `connect()` revives.

pub mod backoff;
pub mod errors;
pub mod handlers;
pub mod heartbeat;
pub mod messages;
pub mod resilient;
pub mod state;
pub mod transport;

pub use backoff::{Backoff, BackoffStep, JitterSource};
pub use errors::{ConnectionError, TransportError};
pub use handlers::{ConnectionHandlers, NoopHandlers};
pub use messages::PushMessage;
pub use resilient::ResilientConnection;
pub use state::{CloseReason, ConnectionState};
pub use transport::{Inbound, Socket, Transport, WsTransport};
