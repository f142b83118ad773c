//! Group id -> channel id mapping table
//!
//! Readers clone an `Arc` snapshot under a short read lock, so `resolve` never
//! waits on a refresh in progress. Writers build a new map and swap it in.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::channel_id::ChannelId;
use super::errors::IdsResult;
use crate::core_backend::{GroupApi, RawIdentifierTable};
use crate::core_groups::types::{GroupId, Timestamp};
use crate::metrics::{record_counter, IDS_REFRESHED, IDS_REFRESH_FAILED};
use crate::persistence::{load_versioned, save_versioned, KvStore, GROUP_IDS_KEY};

type Mappings = BTreeMap<GroupId, ChannelId>;

pub struct IdentifierTable {
    entries: RwLock<Arc<Mappings>>,
    last_refresh: RwLock<Option<Timestamp>>,
    storage: Option<Arc<dyn KvStore>>,
}

impl Default for IdentifierTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierTable {
    /// Table that lives only in memory
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Mappings::new())),
            last_refresh: RwLock::new(None),
            storage: None,
        }
    }

    /// Table persisted under the `group_ids` key of `storage`
    pub fn with_storage(storage: Arc<dyn KvStore>) -> Self {
        Self { storage: Some(storage), ..Self::new() }
    }

    /// Current mappings
    pub fn snapshot(&self) -> Arc<Mappings> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn swap(&self, next: Mappings) {
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, group_id: GroupId) -> bool {
        self.snapshot().contains_key(&group_id)
    }

    /// When the table was last replaced from the server
    pub fn last_refresh(&self) -> Option<Timestamp> {
        *self.last_refresh.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Group ids with a mapping, ascending
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.snapshot().keys().copied().collect()
    }

    /// Channel for a group; the legacy positional form when unmapped
    pub fn resolve(&self, group_id: GroupId) -> ChannelId {
        self.snapshot()
            .get(&group_id)
            .cloned()
            .unwrap_or_else(|| ChannelId::legacy_for(group_id))
    }

    /// Group owning a channel
    ///
    /// Legacy identifiers decode directly. Otherwise mappings are scanned in
    /// ascending group id order and the first match wins; duplicate values
    /// are not disambiguated.
    pub fn reverse_resolve(&self, channel_id: &ChannelId) -> Option<GroupId> {
        if let Some(id) = channel_id.legacy_group_id() {
            return Some(id);
        }
        self.snapshot()
            .iter()
            .find(|(_, mapped)| *mapped == channel_id)
            .map(|(id, _)| *id)
    }

    /// Add a mapping without disturbing an existing one
    ///
    /// Returns false when `group_id` is already mapped to a different channel.
    pub fn register(&self, group_id: GroupId, channel_id: ChannelId) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match guard.get(&group_id) {
            Some(existing) if *existing == channel_id => true,
            Some(existing) => {
                warn!(group_id = %group_id, existing = %existing, rejected = %channel_id, "Refusing to overwrite identifier mapping");
                false
            }
            None => {
                let mut next = Mappings::clone(&guard);
                next.insert(group_id, channel_id);
                *guard = Arc::new(next);
                true
            }
        }
    }

    fn remove_local(&self, group_id: GroupId) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(&group_id) {
            return false;
        }
        let mut next = Mappings::clone(&guard);
        next.remove(&group_id);
        *guard = Arc::new(next);
        true
    }

    /// Replace the cache from the wire form, returning the number of mappings kept
    pub fn replace_from_raw(&self, raw: &RawIdentifierTable) -> usize {
        let mut next = Mappings::new();
        for (key, value) in raw {
            match key.parse::<GroupId>() {
                Ok(id) => {
                    next.insert(id, ChannelId::new(value.clone()));
                }
                Err(_) => warn!(key = %key, "Skipping identifier mapping with non-numeric group id"),
            }
        }
        let count = next.len();
        self.swap(next);
        count
    }

    /// Wire form of the current mappings
    pub fn to_raw(&self) -> RawIdentifierTable {
        self.snapshot()
            .iter()
            .map(|(id, channel)| (id.to_string(), channel.as_str().to_string()))
            .collect()
    }

    /// Replace the cache with the server's table
    pub async fn refresh(&self, api: &dyn GroupApi) -> IdsResult<usize> {
        let raw = match api.fetch_identifiers().await {
            Ok(raw) => raw,
            Err(e) => {
                record_counter(IDS_REFRESH_FAILED, 1);
                return Err(e.into());
            }
        };
        let count = self.replace_from_raw(&raw);
        *self.last_refresh.write().unwrap_or_else(|e| e.into_inner()) = Some(Timestamp::now());
        record_counter(IDS_REFRESHED, 1);
        debug!(mappings = count, "Identifier table refreshed");

        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist identifier table");
        }
        Ok(count)
    }

    /// Invalidate every mapping and adopt the server-regenerated table
    pub async fn reset(&self, api: &dyn GroupApi) -> IdsResult<usize> {
        let raw = api.reset_identifiers().await?;
        let count = self.replace_from_raw(&raw);
        *self.last_refresh.write().unwrap_or_else(|e| e.into_inner()) = Some(Timestamp::now());
        info!(mappings = count, "Identifier table reset");
        self.persist().await?;
        Ok(count)
    }

    /// Drop a mapping locally and on the server
    ///
    /// The local entry goes first; a server that no longer knows the mapping
    /// counts as success.
    pub async fn tombstone(&self, api: &dyn GroupApi, group_id: GroupId) -> IdsResult<()> {
        self.remove_local(group_id);
        match api.delete_identifier(group_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(group_id = %group_id, "Mapping already gone on server"),
            Err(e) => return Err(e.into()),
        }
        self.persist().await?;
        Ok(())
    }

    /// Write the current table to storage, if any
    pub async fn persist(&self) -> IdsResult<()> {
        if let Some(storage) = &self.storage {
            save_versioned(storage.as_ref(), GROUP_IDS_KEY, &self.to_raw()).await?;
        }
        Ok(())
    }

    /// Load the persisted table, returning how many mappings were restored
    pub async fn rehydrate(&self) -> IdsResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        match load_versioned::<RawIdentifierTable>(storage.as_ref(), GROUP_IDS_KEY).await? {
            Some(envelope) => {
                let count = self.replace_from_raw(&envelope.data);
                debug!(mappings = count, saved_at = envelope.saved_at.0, "Identifier table rehydrated");
                Ok(count)
            }
            None => Ok(0),
        }
    }
}
