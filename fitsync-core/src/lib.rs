pub mod config;
pub mod core_backend;
pub mod core_connection;
pub mod core_groups;
pub mod core_ids;
pub mod core_sync;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod retry;
pub mod shutdown;
pub mod test_harness;
pub mod test_utils;

pub use config::{Config, FeatureFlags, FeatureManager};
pub use core_backend::{ApiError, GroupApi, HttpGroupApi};
pub use core_connection::{ConnectionState, ResilientConnection};
pub use core_groups::{Group, GroupDraft, GroupId, GroupPatch, GroupStore, SyncError, SyncResult, UserId};
pub use core_ids::{ChannelId, ChatTarget, IdentifierTable};
pub use core_sync::{SyncOrchestrator, TransportMode};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = TransportMode::Poll;
        assert_eq!(ChannelId::legacy_for(GroupId(3)).as_str(), "group-3");
    }
}
