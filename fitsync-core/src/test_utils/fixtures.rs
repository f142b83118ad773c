//! Test fixtures for groups and drafts
//!
//! Provides builder patterns and factory functions for creating test data.

use std::sync::Arc;

use crate::config::{FeatureFlags, FeatureManager, StoreConfig};
use crate::core_groups::types::{Goal, Group, GroupDraft, GroupId, GroupOrigin, Timestamp, UserId};
use crate::core_groups::GroupStore;
use crate::core_ids::IdentifierTable;
use crate::persistence::{KvStore, MemoryKvStore};
use crate::test_harness::InMemoryBackend;

/// Builder for server-side group records
pub struct TestGroupBuilder {
    group: Group,
}

impl TestGroupBuilder {
    pub fn new(id: u64, creator: u64) -> Self {
        Self {
            group: Group {
                id: GroupId(id),
                name: format!("Group {}", id),
                description: String::new(),
                image: None,
                participant_ids: Vec::new(),
                admin_ids: Vec::new(),
                creator_id: UserId(creator),
                created_at: Timestamp(1_700_000_000_000),
                goals: Vec::new(),
                origin: GroupOrigin::Server,
            },
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.group.name = name.to_string();
        self
    }

    pub fn with_participants(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.group.participant_ids.extend(ids.into_iter().map(UserId));
        self
    }

    pub fn with_admins(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.group.admin_ids.extend(ids.into_iter().map(UserId));
        self
    }

    pub fn with_goal(mut self, title: &str, target: f64) -> Self {
        let id = self.group.goals.len() as u64 + 1;
        self.group.goals.push(Goal {
            id,
            title: title.to_string(),
            target: Some(target),
            unit: Some("km".to_string()),
            progress: 0.0,
        });
        self
    }

    pub fn origin(mut self, origin: GroupOrigin) -> Self {
        self.group.origin = origin;
        self
    }

    /// Raw record, not normalized
    pub fn build_raw(self) -> Group {
        self.group
    }

    pub fn build(self) -> Group {
        self.group.normalized()
    }
}

/// Draft for the "Morning Runners" group
pub fn morning_runners_draft() -> GroupDraft {
    GroupDraft::new("Morning Runners", UserId(1)).with_participants([1])
}

/// Store config with no retry pauses and short roster timeouts
pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        fetch_retry_delay: std::time::Duration::from_millis(1),
        roster_timeout: std::time::Duration::from_millis(200),
        ..StoreConfig::default()
    }
}

/// Everything needed to exercise a store against the in-memory backend
pub struct StoreFixture {
    pub backend: Arc<InMemoryBackend>,
    pub ids: Arc<IdentifierTable>,
    pub storage: Arc<MemoryKvStore>,
    pub store: Arc<GroupStore>,
}

impl StoreFixture {
    pub fn new() -> Self {
        Self::with_flags(FeatureFlags::default())
    }

    pub fn with_flags(flags: FeatureFlags) -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()), Arc::new(MemoryKvStore::new()), flags)
    }

    /// Store sharing an existing backend and storage, e.g. to simulate a restart
    pub fn with_backend(
        backend: Arc<InMemoryBackend>,
        storage: Arc<MemoryKvStore>,
        flags: FeatureFlags,
    ) -> Self {
        let kv: Arc<dyn KvStore> = storage.clone();
        let ids = Arc::new(IdentifierTable::with_storage(kv.clone()));
        let store = Arc::new(GroupStore::new(
            backend.clone(),
            ids.clone(),
            Some(kv),
            fast_store_config(),
            FeatureManager::with_flags(flags),
        ));
        Self { backend, ids, storage, store }
    }
}

impl Default for StoreFixture {
    fn default() -> Self {
        Self::new()
    }
}
