//! Client-side group cache with optimistic mutations
//!
//! The map is published copy-on-write through a watch channel: readers clone
//! an `Arc` snapshot and never block writers, and every change builds a new
//! map. Mutations are applied locally first and reconciled with the server's
//! answer; a failed create or delete never leaves optimistic state behind.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::errors::{SyncError, SyncResult};
use super::types::{
    temporary_group_id, Group, GroupDraft, GroupId, GroupOrigin, GroupPatch, MemberRole, Membership,
    Timestamp, UserId, UNKNOWN_CREATOR,
};
use crate::config::{FeatureManager, StoreConfig};
use crate::core_backend::{ApiError, CreateGroupRequest, GroupApi};
use crate::core_ids::{ChannelId, IdentifierTable, IdsError};
use crate::metrics::{
    record_counter, record_gauge, Timer, MUTATION_COMMITTED, MUTATION_ROLLED_BACK, RESYNC_COMPLETED,
    RESYNC_DURATION_MS, RESYNC_FAILED, RESYNC_ROSTER_FAILURES, RESYNC_SKIPPED, RESYNC_VIRTUAL_GROUPS,
    STORE_GROUPS,
};
use crate::persistence::{load_versioned, save_versioned, KvStore, GROUPS_KEY};
use crate::retry::{retry_if, RetryPolicy};

pub type GroupMap = HashMap<GroupId, Group>;

/// How a resync treats the current map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncOptions {
    /// Run even if another resync is in flight
    pub force: bool,
    /// Keep local optimistic entries the server has not returned yet
    pub merge_with_existing: bool,
}

impl Default for ResyncOptions {
    fn default() -> Self {
        Self { force: false, merge_with_existing: true }
    }
}

impl ResyncOptions {
    pub fn forced() -> Self {
        Self { force: true, ..Self::default() }
    }

    /// Replace the map wholesale, dropping unconfirmed local entries
    pub fn hard_reset() -> Self {
        Self { force: true, merge_with_existing: false }
    }
}

/// What one completed resync did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    /// Entries in the map afterwards
    pub groups: usize,
    pub fetched: usize,
    pub virtual_groups: usize,
    pub roster_failures: usize,
    pub kept_optimistic: usize,
    /// False when the identifier table could not be refreshed and the cache was used
    pub ids_refreshed: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Another resync was already running
    Skipped,
    Completed(ResyncReport),
}

impl ResyncOutcome {
    pub fn report(&self) -> Option<&ResyncReport> {
        match self {
            ResyncOutcome::Completed(report) => Some(report),
            ResyncOutcome::Skipped => None,
        }
    }
}

/// Result of loading persisted state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehydrateReport {
    pub groups: usize,
    pub mappings: usize,
    /// The snapshot was older than the stale threshold, or its age unknown
    pub stale: bool,
    pub resynced: bool,
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    groups: Vec<Group>,
    last_resync: Option<Timestamp>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct GroupStore {
    api: Arc<dyn GroupApi>,
    ids: Arc<IdentifierTable>,
    storage: Option<Arc<dyn KvStore>>,
    config: StoreConfig,
    features: FeatureManager,
    groups: watch::Sender<Arc<GroupMap>>,
    in_flight: AtomicUsize,
    last_started: Mutex<Option<Instant>>,
    last_resync: Mutex<Option<Timestamp>>,
}

impl GroupStore {
    pub fn new(
        api: Arc<dyn GroupApi>,
        ids: Arc<IdentifierTable>,
        storage: Option<Arc<dyn KvStore>>,
        config: StoreConfig,
        features: FeatureManager,
    ) -> Self {
        let (groups, _) = watch::channel(Arc::new(GroupMap::new()));
        Self {
            api,
            ids,
            storage,
            config,
            features,
            groups,
            in_flight: AtomicUsize::new(0),
            last_started: Mutex::new(None),
            last_resync: Mutex::new(None),
        }
    }

    pub fn ids(&self) -> &Arc<IdentifierTable> {
        &self.ids
    }

    pub fn api(&self) -> &Arc<dyn GroupApi> {
        &self.api
    }

    // ---- reads ---------------------------------------------------------

    /// Current map; cheap, never waits on writers
    pub fn snapshot(&self) -> Arc<GroupMap> {
        self.groups.borrow().clone()
    }

    /// Receive every new map
    pub fn subscribe(&self) -> watch::Receiver<Arc<GroupMap>> {
        self.groups.subscribe()
    }

    pub fn get(&self, id: GroupId) -> Option<Group> {
        self.snapshot().get(&id).cloned().map(Group::normalized)
    }

    /// All groups, ordered by id
    pub fn list(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.snapshot().values().cloned().map(Group::normalized).collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn is_member(&self, group_id: GroupId, user_id: UserId) -> bool {
        self.get(group_id).map(|g| g.is_member(user_id)).unwrap_or(false)
    }

    /// Groups `user_id` participates in, ordered by id
    pub fn groups_for_user(&self, user_id: UserId) -> Vec<Group> {
        self.list().into_iter().filter(|g| g.is_member(user_id)).collect()
    }

    /// Completion time of the last successful resync
    pub fn last_resync(&self) -> Option<Timestamp> {
        *self.last_resync.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn resync_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    // ---- local writes ----------------------------------------------------

    /// Build a new map from the current one; publishes only when `f` says so
    fn mutate(&self, f: impl FnOnce(&mut GroupMap) -> bool) -> bool {
        self.groups.send_if_modified(|current| {
            let mut next = GroupMap::clone(current);
            if f(&mut next) {
                *current = Arc::new(next);
                true
            } else {
                false
            }
        })
    }

    /// Insert a local-only entry
    pub fn upsert_local(&self, group: Group) {
        let group = group.with_origin(GroupOrigin::Optimistic).normalized();
        self.mutate(|map| {
            map.insert(group.id, group);
            true
        });
    }

    // ---- optimistic mutations --------------------------------------------

    /// Create a group, visible immediately under a temporary id
    pub async fn create(&self, draft: GroupDraft) -> SyncResult<Group> {
        let temp_id = temporary_group_id();
        let optimistic = draft.to_group(temp_id);
        self.mutate(|map| {
            map.insert(temp_id, optimistic);
            true
        });
        debug!(temp_id = %temp_id, name = %draft.name, "Inserted optimistic group");

        let channel = ChannelId::generate_tagged();
        let request = CreateGroupRequest::from_draft(&draft, channel.as_str());

        let created = match self.api.create_group(&request).await {
            Ok(created) => created,
            Err(e) => {
                self.mutate(|map| map.remove(&temp_id).is_some());
                record_counter(MUTATION_ROLLED_BACK, 1);
                warn!(temp_id = %temp_id, error = %e, "Group create failed, optimistic entry removed");
                return Err(e.into());
            }
        };

        let confirmed = created.with_origin(GroupOrigin::Server).normalized();
        let id = confirmed.id;
        let swapped = confirmed.clone();
        self.mutate(|map| {
            map.remove(&temp_id);
            map.insert(id, swapped);
            true
        });
        record_counter(MUTATION_COMMITTED, 1);
        info!(temp_id = %temp_id, group_id = %id, "Group created");

        self.ids.register(id, channel);
        if let Err(e) = self.ids.persist().await {
            warn!(error = %e, "Failed to persist identifier table");
        }
        if let Err(e) = self.resync(ResyncOptions::forced()).await {
            warn!(error = %e, "Resync after create failed");
        }

        Ok(self.get(id).unwrap_or(confirmed))
    }

    /// Patch a group locally, then confirm with the server
    ///
    /// A rejected patch is rolled back to the previous value.
    pub async fn update(&self, id: GroupId, patch: GroupPatch) -> SyncResult<Group> {
        let mut previous = None;
        self.mutate(|map| match map.get_mut(&id) {
            Some(group) => {
                previous = Some(group.clone());
                group.apply_patch(&patch);
                true
            }
            None => false,
        });
        let previous = previous.ok_or(SyncError::NotFound(id))?;

        match self.api.update_group(id, &patch).await {
            Ok(server) => {
                let confirmed = server.with_origin(GroupOrigin::Server).normalized();
                let stored = confirmed.clone();
                self.mutate(|map| {
                    map.insert(id, stored);
                    true
                });
                record_counter(MUTATION_COMMITTED, 1);
                debug!(group_id = %id, "Group update confirmed");
                self.persist_logged().await;
                Ok(confirmed)
            }
            Err(e) => {
                self.mutate(|map| match map.get_mut(&id) {
                    Some(group) => {
                        *group = previous;
                        true
                    }
                    None => false,
                });
                record_counter(MUTATION_ROLLED_BACK, 1);
                warn!(group_id = %id, error = %e, "Group update failed, rolled back");
                Err(e.into())
            }
        }
    }

    /// Delete a group
    ///
    /// The entry disappears locally first. If the server refuses, a forced
    /// resync restores whatever the server still holds.
    pub async fn remove(&self, id: GroupId) -> SyncResult<()> {
        let mut removed = None;
        self.mutate(|map| {
            removed = map.remove(&id);
            removed.is_some()
        });
        let removed = removed.ok_or(SyncError::NotFound(id))?;

        if let Err(e) = self.ids.tombstone(self.api.as_ref(), id).await {
            warn!(group_id = %id, error = %e, "Failed to tombstone identifier mapping");
        }

        match self.api.delete_group(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(group_id = %id, is_virtual = removed.is_virtual(), "Group already absent on server");
            }
            Err(e) => {
                record_counter(MUTATION_ROLLED_BACK, 1);
                warn!(group_id = %id, error = %e, "Group delete failed, resyncing");
                if let Err(resync_err) = self.resync(ResyncOptions::forced()).await {
                    warn!(error = %resync_err, "Recovery resync failed");
                }
                return Err(e.into());
            }
        }

        record_counter(MUTATION_COMMITTED, 1);
        info!(group_id = %id, "Group removed");
        self.persist_logged().await;
        Ok(())
    }

    // ---- reconciliation --------------------------------------------------

    /// Reconcile the local map with the server of record
    pub async fn resync(&self, options: ResyncOptions) -> SyncResult<ResyncOutcome> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 && !options.force {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            record_counter(RESYNC_SKIPPED, 1);
            debug!("Resync already in flight, skipping");
            return Ok(ResyncOutcome::Skipped);
        }
        let _guard = InFlight(&self.in_flight);

        {
            let mut last = self.last_started.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last {
                if prev.elapsed() < self.config.min_resync_interval {
                    debug!(since = ?prev.elapsed(), "Resync shortly after the previous one, proceeding");
                }
            }
            *last = Some(Instant::now());
        }

        let timer = Timer::new(RESYNC_DURATION_MS);
        let policy = RetryPolicy::from(&self.config);

        let ids_refreshed = match retry_if(policy, "identifier table refresh", IdsError::is_transient, || {
            self.ids.refresh(self.api.as_ref())
        })
        .await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, cached = self.ids.len(), "Identifier table unavailable, using cached mappings");
                false
            }
        };

        let fetched = match retry_if(policy, "group fetch", ApiError::is_transient, || self.api.list_groups()).await {
            Ok(groups) => groups,
            Err(e) => {
                record_counter(RESYNC_FAILED, 1);
                warn!(error = %e, "Resync aborted, groups unavailable");
                return Err(e.into());
            }
        };
        let fetched_count = fetched.len();
        let fetched_ids: HashSet<GroupId> = fetched.iter().map(|g| g.id).collect();

        let current = self.snapshot();
        let virtuals: Vec<Group> = if self.features.virtual_groups_enabled() {
            self.ids
                .group_ids()
                .into_iter()
                .filter(|id| !fetched_ids.contains(id))
                .map(|id| {
                    let creator = current.get(&id).map(|g| g.creator_id).unwrap_or(UNKNOWN_CREATOR);
                    Group::virtual_placeholder(id, creator)
                })
                .collect()
        } else {
            Vec::new()
        };
        let virtual_count = virtuals.len();
        if virtual_count > 0 {
            debug!(orphans = virtual_count, "Synthesized virtual groups for orphaned mappings");
        }

        let combined: Vec<Group> = fetched
            .into_iter()
            .map(|g| g.with_origin(GroupOrigin::Server))
            .chain(virtuals)
            .collect();
        let rosters = self.fetch_rosters(&combined).await;
        let roster_failures = rosters.iter().filter(|r| r.is_none()).count();

        let incoming: GroupMap = combined
            .into_iter()
            .zip(rosters)
            .map(|(group, roster)| {
                let group = fold_roster(group, roster.as_deref().unwrap_or(&[]));
                (group.id, group)
            })
            .collect();

        let mut kept_optimistic = 0;
        let mut total = 0;
        self.groups.send_modify(|map| {
            let mut next: GroupMap = if options.merge_with_existing {
                map.iter()
                    .filter(|(id, g)| g.is_optimistic() && !incoming.contains_key(id))
                    .map(|(id, g)| (*id, g.clone()))
                    .collect()
            } else {
                GroupMap::new()
            };
            kept_optimistic = next.len();
            next.extend(incoming);
            total = next.len();
            *map = Arc::new(next);
        });

        *self.last_resync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Timestamp::now());
        self.persist_logged().await;

        let duration = Duration::from_secs_f64(timer.stop() / 1000.0);
        record_counter(RESYNC_COMPLETED, 1);
        record_counter(RESYNC_ROSTER_FAILURES, roster_failures as u64);
        record_gauge(RESYNC_VIRTUAL_GROUPS, virtual_count as f64);
        record_gauge(STORE_GROUPS, total as f64);
        info!(
            groups = total,
            fetched = fetched_count,
            virtual_groups = virtual_count,
            roster_failures,
            kept_optimistic,
            ids_refreshed,
            "Resync complete"
        );

        Ok(ResyncOutcome::Completed(ResyncReport {
            groups: total,
            fetched: fetched_count,
            virtual_groups: virtual_count,
            roster_failures,
            kept_optimistic,
            ids_refreshed,
            duration,
        }))
    }

    /// Fetch every roster concurrently; `None` marks a timeout or failure
    async fn fetch_rosters(&self, groups: &[Group]) -> Vec<Option<Vec<Membership>>> {
        let limit = self.config.roster_timeout;
        let api = self.api.as_ref();
        join_all(groups.iter().map(|g| {
            let id = g.id;
            async move {
                match tokio::time::timeout(limit, api.list_members(id)).await {
                    Ok(Ok(roster)) => Some(roster),
                    Ok(Err(e)) => {
                        debug!(group_id = %id, error = %e, "Roster fetch failed, using empty roster");
                        None
                    }
                    Err(_) => {
                        debug!(group_id = %id, timeout = ?limit, "Roster fetch timed out, using empty roster");
                        None
                    }
                }
            }
        }))
        .await
    }

    // ---- persistence -----------------------------------------------------

    /// Write confirmed groups to storage; virtual and optimistic entries stay local
    pub async fn persist(&self) -> SyncResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut groups: Vec<Group> = self
            .snapshot()
            .values()
            .filter(|g| g.origin == GroupOrigin::Server)
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.id);

        let snapshot = StoreSnapshot { groups, last_resync: self.last_resync() };
        save_versioned(storage.as_ref(), GROUPS_KEY, &snapshot).await?;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist group snapshot");
        }
    }

    /// Load persisted groups and mappings; resync if the snapshot is stale
    pub async fn rehydrate(&self) -> SyncResult<RehydrateReport> {
        let mappings = self.ids.rehydrate().await?;

        let (groups, last_resync) = match &self.storage {
            Some(storage) => match load_versioned::<StoreSnapshot>(storage.as_ref(), GROUPS_KEY).await? {
                Some(envelope) => (envelope.data.groups, envelope.data.last_resync),
                None => (Vec::new(), None),
            },
            None => (Vec::new(), None),
        };

        let restored: GroupMap = groups
            .into_iter()
            .map(|g| (g.id, g.with_origin(GroupOrigin::Server).normalized()))
            .collect();
        let count = restored.len();
        self.groups.send_replace(Arc::new(restored));
        *self.last_resync.lock().unwrap_or_else(|e| e.into_inner()) = last_resync;

        let stale = last_resync.map(|t| t.age() > self.config.stale_after).unwrap_or(true);
        info!(groups = count, mappings, stale, "Rehydrated group store");

        let mut resynced = false;
        if stale && self.features.resync_on_rehydrate() {
            match self.resync(ResyncOptions::forced()).await {
                Ok(outcome) => resynced = outcome.report().is_some(),
                Err(e) => warn!(error = %e, "Resync after rehydrate failed, serving cached groups"),
            }
        }

        Ok(RehydrateReport { groups: count, mappings, stale, resynced })
    }
}

/// Merge a fetched roster into a group
///
/// A virtual group with no known creator adopts the first roster admin (or
/// member) as its creator.
fn fold_roster(mut group: Group, roster: &[Membership]) -> Group {
    if group.has_unknown_creator() {
        let adopted = roster
            .iter()
            .find(|m| m.role == MemberRole::Admin)
            .or_else(|| roster.first())
            .map(|m| m.user_id);
        if let Some(creator) = adopted {
            group.creator_id = creator;
            group.participant_ids.clear();
            group.admin_ids.clear();
        }
    }
    group.merge_roster(roster);
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::core_backend::{ApiResult, RawIdentifierTable};
    use crate::persistence::{MemoryKvStore, SNAPSHOT_VERSION};
    use crate::test_harness::InMemoryBackend;
    use crate::test_utils::{assert_roster_invariants, morning_runners_draft, settle, StoreFixture, TestGroupBuilder};
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    /// Backend whose creates wait for a permit
    struct GatedApi {
        inner: Arc<InMemoryBackend>,
        gate: Semaphore,
    }

    #[async_trait]
    impl GroupApi for GatedApi {
        async fn list_groups(&self) -> ApiResult<Vec<Group>> {
            self.inner.list_groups().await
        }
        async fn list_members(&self, id: GroupId) -> ApiResult<Vec<Membership>> {
            self.inner.list_members(id).await
        }
        async fn create_group(&self, request: &CreateGroupRequest) -> ApiResult<Group> {
            let _permit = self.gate.acquire().await.map_err(|e| ApiError::Transport(e.to_string()))?;
            self.inner.create_group(request).await
        }
        async fn update_group(&self, id: GroupId, patch: &GroupPatch) -> ApiResult<Group> {
            self.inner.update_group(id, patch).await
        }
        async fn delete_group(&self, id: GroupId) -> ApiResult<()> {
            self.inner.delete_group(id).await
        }
        async fn fetch_identifiers(&self) -> ApiResult<RawIdentifierTable> {
            self.inner.fetch_identifiers().await
        }
        async fn delete_identifier(&self, id: GroupId) -> ApiResult<()> {
            self.inner.delete_identifier(id).await
        }
        async fn reset_identifiers(&self) -> ApiResult<RawIdentifierTable> {
            self.inner.reset_identifiers().await
        }
    }

    #[tokio::test]
    async fn test_create_is_visible_before_confirmation() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_next_id(57);
        let api = Arc::new(GatedApi { inner: backend.clone(), gate: Semaphore::new(0) });
        let store = Arc::new(GroupStore::new(
            api.clone(),
            Arc::new(IdentifierTable::new()),
            None,
            crate::test_utils::fast_store_config(),
            FeatureManager::new(),
        ));

        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.create(morning_runners_draft()).await }
        });
        settle().await;

        let optimistic = store.list();
        assert_eq!(optimistic.len(), 1);
        let temp = &optimistic[0];
        assert!(temp.is_optimistic());
        assert!(temp.id.0 > 1_000_000_000_000);
        assert_eq!(temp.participant_ids, vec![UserId(1)]);
        assert_eq!(temp.admin_ids, vec![UserId(1)]);
        let temp_id = temp.id;

        api.gate.add_permits(1);
        let created = pending.await.unwrap().unwrap();

        assert_eq!(created.id, GroupId(57));
        assert!(created.admin_ids.contains(&UserId(1)));
        assert!(store.get(temp_id).is_none());
        assert_eq!(store.list().iter().map(|g| g.id).collect::<Vec<_>>(), vec![GroupId(57)]);
        assert!(store.ids().contains(GroupId(57)));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_nothing_behind() {
        let fx = StoreFixture::new();
        fx.backend.fail_next_mutations(1);

        let err = fx.store.create(morning_runners_draft()).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(_)));
        assert!(fx.store.is_empty());
        assert!(fx.backend.groups().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_mapping_becomes_virtual_group() {
        let fx = StoreFixture::new();
        fx.backend.insert_identifier(GroupId(7), "group-uuid-abc123");

        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.virtual_groups, 1);

        let groups = fx.store.list();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, GroupId(7));
        assert!(groups[0].is_virtual());
        assert_eq!(groups[0].name, "Group 7");
        assert_eq!(fx.ids.resolve(GroupId(7)).as_str(), "group-uuid-abc123");
        assert!(groups[0].participant_ids.is_empty());
        assert!(fx.store.groups_for_user(UNKNOWN_CREATOR).is_empty());
        assert!(!fx.store.is_member(GroupId(7), UNKNOWN_CREATOR));

        let first = fx.store.get(GroupId(7)).unwrap();
        fx.store.resync(ResyncOptions::forced()).await.unwrap();
        assert_eq!(fx.store.get(GroupId(7)).unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_group_with_failed_roster_has_no_members() {
        let fx = StoreFixture::new();
        fx.backend.insert_identifier(GroupId(8), "group-uuid-lost");
        fx.backend.fail_roster(GroupId(8));

        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(outcome.report().unwrap().roster_failures, 1);
        let group = fx.store.get(GroupId(8)).unwrap();
        assert!(group.participant_ids.is_empty());
        assert!(group.admin_ids.is_empty());
        assert!(fx.store.groups_for_user(UNKNOWN_CREATOR).is_empty());
    }

    #[tokio::test]
    async fn test_virtual_group_superseded_by_real_record() {
        let fx = StoreFixture::new();
        fx.backend.insert_identifier(GroupId(42), "group-uuid-late");
        fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert!(fx.store.get(GroupId(42)).unwrap().is_virtual());

        fx.backend.insert_group(TestGroupBuilder::new(42, 3).named("Hill Repeats").build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();

        let group = fx.store.get(GroupId(42)).unwrap();
        assert!(!group.is_virtual());
        assert_eq!(group.name, "Hill Repeats");
    }

    #[tokio::test]
    async fn test_virtual_group_adopts_roster_creator() {
        let fx = StoreFixture::new();
        fx.backend.insert_identifier(GroupId(9), "group-uuid-orphan");
        fx.backend.add_member(GroupId(9), UserId(4), MemberRole::Member);
        fx.backend.add_member(GroupId(9), UserId(5), MemberRole::Admin);

        fx.store.resync(ResyncOptions::default()).await.unwrap();
        let group = fx.store.get(GroupId(9)).unwrap();

        assert_eq!(group.creator_id, UserId(5));
        assert!(group.is_member(UserId(4)));
        assert!(!group.is_member(UNKNOWN_CREATOR));
        assert_roster_invariants(&group);
    }

    #[tokio::test]
    async fn test_virtual_groups_can_be_disabled() {
        let flags = FeatureFlags { virtual_groups: false, ..FeatureFlags::default() };
        let fx = StoreFixture::with_flags(flags);
        fx.backend.insert_identifier(GroupId(7), "group-uuid-abc123");

        fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_merge_keeps_optimistic_and_hard_reset_drops_it() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());
        fx.store.upsert_local(TestGroupBuilder::new(999_999, 2).build());

        let merged = fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(merged.report().unwrap().kept_optimistic, 1);
        assert!(fx.store.get(GroupId(999_999)).is_some());

        fx.store.resync(ResyncOptions::hard_reset()).await.unwrap();
        assert!(fx.store.get(GroupId(999_999)).is_none());
        assert!(fx.store.get(GroupId(1)).is_some());
    }

    #[tokio::test]
    async fn test_merge_drops_groups_gone_from_server() {
        let fx = StoreFixture::new();
        let id = fx.backend.insert_group(TestGroupBuilder::new(3, 1).build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert!(fx.store.get(id).is_some());

        fx.backend.drop_group_record(id);
        fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert!(fx.store.get(id).is_none());
    }

    #[tokio::test]
    async fn test_update_confirms_and_rolls_back() {
        let fx = StoreFixture::new();
        let id = fx.backend.insert_group(TestGroupBuilder::new(5, 1).named("Old").build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();

        let updated = fx.store.update(id, GroupPatch::rename("New")).await.unwrap();
        assert_eq!(updated.name, "New");
        assert_eq!(fx.backend.group(id).unwrap().name, "New");

        fx.backend.fail_next_mutations(1);
        let err = fx.store.update(id, GroupPatch::rename("Broken")).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(_)));
        assert_eq!(fx.store.get(id).unwrap().name, "New");

        assert!(fx.store.update(GroupId(404), GroupPatch::rename("x")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_tombstones_and_deletes() {
        let fx = StoreFixture::new();
        let created = fx.store.create(morning_runners_draft()).await.unwrap();
        assert!(fx.backend.identifiers().contains_key(&created.id.to_string()));

        fx.store.remove(created.id).await.unwrap();
        assert!(fx.store.get(created.id).is_none());
        assert!(fx.backend.groups().is_empty());
        assert!(fx.backend.identifiers().is_empty());

        assert!(matches!(fx.store.remove(created.id).await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_remove_restores_from_server() {
        let fx = StoreFixture::new();
        let id = fx.backend.insert_group(TestGroupBuilder::new(8, 1).build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();

        fx.backend.fail_next_mutations(1);
        assert!(fx.store.remove(id).await.is_err());
        assert!(fx.store.get(id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_fetch_failure_leaves_store_untouched() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();
        let before = fx.store.snapshot();

        fx.backend.insert_group(TestGroupBuilder::new(2, 1).build());
        fx.backend.fail_next_group_fetches(3);
        assert!(fx.store.resync(ResyncOptions::default()).await.is_err());
        assert_eq!(*fx.store.snapshot(), *before);

        fx.backend.fail_next_group_fetches(2);
        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(outcome.report().unwrap().fetched, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_group_list_aborts_without_retrying() {
        let fx = StoreFixture::new();
        fx.backend.fail_next_group_fetches_with(3, ApiError::Decode("missing field `id`".to_string()));

        let err = fx.store.resync(ResyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(ApiError::Decode(_))));
        assert_eq!(fx.backend.calls("list_groups"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifier_outage_falls_back_to_cache() {
        let fx = StoreFixture::new();
        fx.backend.insert_identifier(GroupId(7), "group-uuid-abc123");
        fx.store.resync(ResyncOptions::default()).await.unwrap();

        fx.backend.fail_next_identifier_fetches(3);
        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        let report = outcome.report().unwrap();
        assert!(!report.ids_refreshed);
        assert_eq!(report.virtual_groups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_or_failing_rosters_degrade_to_empty() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).with_participants([2]).build());
        fx.backend.insert_group(TestGroupBuilder::new(2, 1).build());
        fx.backend.add_member(GroupId(2), UserId(9), MemberRole::Member);
        fx.backend.fail_roster(GroupId(1));

        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(outcome.report().unwrap().roster_failures, 1);
        // The group record itself still carries its participants.
        assert!(fx.store.is_member(GroupId(1), UserId(2)));
        assert!(fx.store.is_member(GroupId(2), UserId(9)));

        fx.backend.set_roster_delay(Some(Duration::from_secs(10)));
        let outcome = fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(outcome.report().unwrap().roster_failures, 2);
        assert!(!fx.store.is_member(GroupId(2), UserId(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resync_is_skipped_unless_forced() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());
        fx.backend.set_roster_delay(Some(Duration::from_millis(100)));

        let running = tokio::spawn({
            let store = fx.store.clone();
            async move { store.resync(ResyncOptions::default()).await }
        });
        settle().await;
        assert!(fx.store.resync_in_flight());

        assert_eq!(fx.store.resync(ResyncOptions::default()).await.unwrap(), ResyncOutcome::Skipped);
        assert!(fx.store.resync(ResyncOptions::forced()).await.unwrap().report().is_some());
        assert!(running.await.unwrap().unwrap().report().is_some());
        assert!(!fx.store.resync_in_flight());
    }

    #[tokio::test]
    async fn test_membership_queries() {
        let fx = StoreFixture::new();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).with_participants([2, 3]).build());
        fx.backend.insert_group(TestGroupBuilder::new(2, 3).build());
        fx.backend.insert_group(TestGroupBuilder::new(3, 4).build());
        fx.store.resync(ResyncOptions::default()).await.unwrap();

        assert!(fx.store.is_member(GroupId(1), UserId(2)));
        assert!(!fx.store.is_member(GroupId(3), UserId(2)));
        assert!(!fx.store.is_member(GroupId(99), UserId(1)));

        let ids: Vec<_> = fx.store.groups_for_user(UserId(3)).iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![GroupId(1), GroupId(2)]);
        for group in fx.store.list() {
            assert_roster_invariants(&group);
        }
    }

    #[tokio::test]
    async fn test_reads_normalize_raw_entries() {
        let fx = StoreFixture::new();
        let raw = TestGroupBuilder::new(11, 6).build_raw();
        fx.store.mutate(|map| {
            map.insert(raw.id, raw);
            true
        });
        let group = fx.store.get(GroupId(11)).unwrap();
        assert_eq!(group.participant_ids, vec![UserId(6)]);
        assert_eq!(group.admin_ids, vec![UserId(6)]);
    }

    #[tokio::test]
    async fn test_observers_see_each_new_map() {
        let fx = StoreFixture::new();
        let mut rx = fx.store.subscribe();
        fx.backend.insert_group(TestGroupBuilder::new(1, 1).build());

        fx.store.resync(ResyncOptions::default()).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_rehydrates_without_resync() {
        let storage = Arc::new(MemoryKvStore::new());
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_group(TestGroupBuilder::new(1, 1).build());
        backend.insert_identifier(GroupId(1), "group-uuid-one");
        backend.insert_identifier(GroupId(2), "group-uuid-orphan");

        let first = StoreFixture::with_backend(backend.clone(), storage.clone(), FeatureFlags::default());
        first.store.resync(ResyncOptions::default()).await.unwrap();
        assert_eq!(first.store.len(), 2);
        let fetches = backend.calls("list_groups");

        let second = StoreFixture::with_backend(backend.clone(), storage, FeatureFlags::default());
        let report = second.store.rehydrate().await.unwrap();

        assert_eq!(report, RehydrateReport { groups: 1, mappings: 2, stale: false, resynced: false });
        assert!(second.store.get(GroupId(2)).is_none());
        assert_eq!(second.ids.resolve(GroupId(1)).as_str(), "group-uuid-one");
        assert_eq!(backend.calls("list_groups"), fetches);
    }

    #[tokio::test]
    async fn test_stale_snapshot_triggers_resync() {
        let storage = Arc::new(MemoryKvStore::new());
        let stale_at = Timestamp(Timestamp::now().0 - 3 * 3600 * 1000);
        let body = serde_json::json!({
            "version": SNAPSHOT_VERSION,
            "saved_at": stale_at,
            "data": { "groups": [], "last_resync": stale_at },
        });
        storage.put(GROUPS_KEY, serde_json::to_vec(&body).unwrap()).await.unwrap();

        let backend = Arc::new(InMemoryBackend::new());
        backend.insert_group(TestGroupBuilder::new(1, 1).build());
        let fx = StoreFixture::with_backend(backend, storage, FeatureFlags::default());

        let report = fx.store.rehydrate().await.unwrap();
        assert!(report.stale);
        assert!(report.resynced);
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_storage_counts_as_stale() {
        let flags = FeatureFlags { resync_on_rehydrate: false, ..FeatureFlags::default() };
        let fx = StoreFixture::with_flags(flags);
        let report = fx.store.rehydrate().await.unwrap();
        assert!(report.stale);
        assert!(!report.resynced);
    }
}
