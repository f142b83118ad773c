//! In-memory server of record
//!
//! Implements [`GroupApi`] directly so tests can drive the store without a
//! socket, and backs the axum harness for over-the-wire runs. Every mutation
//! broadcasts a `group_update` notification to push subscribers.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core_backend::{ApiError, ApiResult, CreateGroupRequest, GroupApi, RawIdentifierTable};
use crate::core_connection::PushMessage;
use crate::core_groups::types::{
    Group, GroupId, GroupOrigin, GroupPatch, MemberRole, Membership, Timestamp, UserId,
};
use crate::core_ids::ChannelId;

const FIRST_GROUP_ID: u64 = 1;

#[derive(Default)]
struct Failures {
    group_fetches: u32,
    group_fetch_error: Option<ApiError>,
    identifier_fetches: u32,
    mutations: u32,
    rosters: HashSet<GroupId>,
}

struct Inner {
    groups: BTreeMap<GroupId, Group>,
    extra_members: HashMap<GroupId, Vec<Membership>>,
    identifiers: RawIdentifierTable,
    next_id: u64,
    failures: Failures,
    roster_delay: Option<Duration>,
    calls: HashMap<&'static str, u32>,
}

pub struct InMemoryBackend {
    inner: Mutex<Inner>,
    updates: broadcast::Sender<PushMessage>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn injected() -> ApiError {
    ApiError::Http { status: 503, message: "injected failure".to_string() }
}

fn not_found(what: &str, id: GroupId) -> ApiError {
    ApiError::Http { status: 404, message: format!("{} {} not found", what, id) }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner {
                groups: BTreeMap::new(),
                extra_members: HashMap::new(),
                identifiers: RawIdentifierTable::new(),
                next_id: FIRST_GROUP_ID,
                failures: Failures::default(),
                roster_delay: None,
                calls: HashMap::new(),
            }),
            updates,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn count_call(&self, name: &'static str) {
        *self.lock().calls.entry(name).or_insert(0) += 1;
    }

    fn notify(&self, group_id: Option<GroupId>) {
        // No subscribers is fine.
        let _ = self.updates.send(PushMessage::GroupUpdate { group_id });
    }

    /// Receive a notification for every mutation
    pub fn subscribe_updates(&self) -> broadcast::Receiver<PushMessage> {
        self.updates.subscribe()
    }

    /// Seed a group as if created out of band; an id of 0 assigns the next one
    pub fn insert_group(&self, group: Group) -> GroupId {
        let mut inner = self.lock();
        let id = if group.id.0 == 0 { GroupId(inner.next_id) } else { group.id };
        inner.next_id = inner.next_id.max(id.0 + 1);
        let stored = Group { id, origin: GroupOrigin::Server, ..group }.normalized();
        inner.groups.insert(id, stored);
        drop(inner);
        self.notify(Some(id));
        id
    }

    /// Seed an identifier mapping, with or without a group behind it
    pub fn insert_identifier(&self, group_id: GroupId, channel_id: impl Into<String>) {
        self.lock().identifiers.insert(group_id.to_string(), channel_id.into());
    }

    /// Id the next created group receives
    pub fn set_next_id(&self, id: u64) {
        self.lock().next_id = id;
    }

    /// Add a roster row beyond the group's own participant lists
    pub fn add_member(&self, group_id: GroupId, user_id: UserId, role: MemberRole) {
        self.lock()
            .extra_members
            .entry(group_id)
            .or_default()
            .push(Membership { group_id, user_id, role });
    }

    /// Drop a group record but keep its mapping, producing divergence
    pub fn drop_group_record(&self, group_id: GroupId) -> bool {
        self.lock().groups.remove(&group_id).is_some()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.lock().groups.values().cloned().collect()
    }

    pub fn group(&self, group_id: GroupId) -> Option<Group> {
        self.lock().groups.get(&group_id).cloned()
    }

    pub fn identifiers(&self) -> RawIdentifierTable {
        self.lock().identifiers.clone()
    }

    /// How many times a [`GroupApi`] method was invoked
    pub fn calls(&self, method: &str) -> u32 {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn fail_next_group_fetches(&self, n: u32) {
        let mut inner = self.lock();
        inner.failures.group_fetches = n;
        inner.failures.group_fetch_error = None;
    }

    /// Like [`fail_next_group_fetches`](Self::fail_next_group_fetches) with a chosen error
    pub fn fail_next_group_fetches_with(&self, n: u32, error: ApiError) {
        let mut inner = self.lock();
        inner.failures.group_fetches = n;
        inner.failures.group_fetch_error = Some(error);
    }

    pub fn fail_next_identifier_fetches(&self, n: u32) {
        self.lock().failures.identifier_fetches = n;
    }

    /// Fail the next `n` create/update/delete calls
    pub fn fail_next_mutations(&self, n: u32) {
        self.lock().failures.mutations = n;
    }

    pub fn fail_roster(&self, group_id: GroupId) {
        self.lock().failures.rosters.insert(group_id);
    }

    /// Delay every roster response, to exercise client-side timeouts
    pub fn set_roster_delay(&self, delay: Option<Duration>) {
        self.lock().roster_delay = delay;
    }

    fn check_mutation(&self) -> ApiResult<()> {
        if take_failure(&mut self.lock().failures.mutations) {
            return Err(injected());
        }
        Ok(())
    }

    fn roster_rows(inner: &Inner, group_id: GroupId) -> Option<Vec<Membership>> {
        let group = inner.groups.get(&group_id);
        let extra = inner.extra_members.get(&group_id);
        if group.is_none() && extra.is_none() {
            return None;
        }

        let mut rows = Vec::new();
        if let Some(group) = group {
            for user_id in &group.participant_ids {
                let role = if group.admin_ids.contains(user_id) {
                    MemberRole::Admin
                } else {
                    MemberRole::Member
                };
                rows.push(Membership { group_id, user_id: *user_id, role });
            }
        }
        rows.extend(extra.into_iter().flatten().cloned());
        Some(rows)
    }
}

#[async_trait]
impl GroupApi for InMemoryBackend {
    async fn list_groups(&self) -> ApiResult<Vec<Group>> {
        self.count_call("list_groups");
        let mut inner = self.lock();
        if take_failure(&mut inner.failures.group_fetches) {
            return Err(inner.failures.group_fetch_error.clone().unwrap_or_else(injected));
        }
        Ok(inner.groups.values().cloned().collect())
    }

    async fn list_members(&self, group_id: GroupId) -> ApiResult<Vec<Membership>> {
        self.count_call("list_members");
        let delay = self.lock().roster_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.lock();
        if inner.failures.rosters.contains(&group_id) {
            return Err(injected());
        }
        Self::roster_rows(&inner, group_id).ok_or_else(|| not_found("roster for group", group_id))
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> ApiResult<Group> {
        self.count_call("create_group");
        self.check_mutation()?;

        let group = {
            let mut inner = self.lock();
            let id = GroupId(inner.next_id);
            inner.next_id += 1;

            let group = Group {
                id,
                name: request.name.clone(),
                description: request.description.clone(),
                image: request.image.clone(),
                participant_ids: request.participant_ids.clone(),
                admin_ids: request.admin_ids.clone(),
                creator_id: request.creator_id,
                created_at: Timestamp::now(),
                goals: request.goals.clone(),
                origin: GroupOrigin::Server,
            }
            .normalized();

            inner.groups.insert(id, group.clone());
            inner
                .identifiers
                .entry(id.to_string())
                .or_insert_with(|| request.channel_id.clone());
            group
        };

        debug!(group_id = %group.id, "Backend created group");
        self.notify(Some(group.id));
        Ok(group)
    }

    async fn update_group(&self, group_id: GroupId, patch: &GroupPatch) -> ApiResult<Group> {
        self.count_call("update_group");
        self.check_mutation()?;

        let group = {
            let mut inner = self.lock();
            let group = inner.groups.get_mut(&group_id).ok_or_else(|| not_found("group", group_id))?;
            group.apply_patch(patch);
            group.clone()
        };

        self.notify(Some(group_id));
        Ok(group)
    }

    async fn delete_group(&self, group_id: GroupId) -> ApiResult<()> {
        self.count_call("delete_group");
        self.check_mutation()?;

        let removed = {
            let mut inner = self.lock();
            inner.extra_members.remove(&group_id);
            inner.groups.remove(&group_id).is_some()
        };
        if !removed {
            return Err(not_found("group", group_id));
        }

        self.notify(Some(group_id));
        Ok(())
    }

    async fn fetch_identifiers(&self) -> ApiResult<RawIdentifierTable> {
        self.count_call("fetch_identifiers");
        let mut inner = self.lock();
        if take_failure(&mut inner.failures.identifier_fetches) {
            return Err(injected());
        }
        Ok(inner.identifiers.clone())
    }

    async fn delete_identifier(&self, group_id: GroupId) -> ApiResult<()> {
        self.count_call("delete_identifier");
        let removed = self.lock().identifiers.remove(&group_id.to_string()).is_some();
        if removed {
            Ok(())
        } else {
            Err(not_found("mapping for group", group_id))
        }
    }

    async fn reset_identifiers(&self) -> ApiResult<RawIdentifierTable> {
        self.count_call("reset_identifiers");
        let table = {
            let mut inner = self.lock();
            let mut ids: Vec<String> = inner.identifiers.keys().cloned().collect();
            ids.extend(inner.groups.keys().map(|id| id.to_string()));

            inner.identifiers = ids
                .into_iter()
                .map(|id| (id, ChannelId::generate_tagged().into_string()))
                .collect();
            inner.identifiers.clone()
        };

        self.notify(None);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_groups::types::GroupDraft;

    #[tokio::test]
    async fn test_create_assigns_ids_and_records_mapping() {
        let backend = InMemoryBackend::new();
        let mut updates = backend.subscribe_updates();

        let draft = GroupDraft::new("Morning Runners", UserId(1));
        let created = backend
            .create_group(&CreateGroupRequest::from_draft(&draft, "group-uuid-x"))
            .await
            .unwrap();

        assert_eq!(created.id, GroupId(1));
        assert_eq!(backend.identifiers().get("1").map(String::as_str), Some("group-uuid-x"));
        assert_eq!(updates.recv().await.unwrap(), PushMessage::GroupUpdate { group_id: Some(GroupId(1)) });
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = InMemoryBackend::new();
        backend.fail_next_group_fetches(2);

        assert!(backend.list_groups().await.is_err());
        assert!(backend.list_groups().await.is_err());
        assert!(backend.list_groups().await.is_ok());
        assert_eq!(backend.calls("list_groups"), 3);
    }

    #[tokio::test]
    async fn test_roster_combines_group_and_extra_rows() {
        let backend = InMemoryBackend::new();
        let id = backend.insert_group(Group::virtual_placeholder(GroupId(0), UserId(1)));
        backend.add_member(id, UserId(2), MemberRole::Member);

        let rows = backend.list_members(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, MemberRole::Admin);

        assert!(backend.list_members(GroupId(999)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reset_regenerates_every_mapping() {
        let backend = InMemoryBackend::new();
        backend.insert_identifier(GroupId(4), "group-4");
        let table = backend.reset_identifiers().await.unwrap();

        let channel = ChannelId::new(table["4"].clone());
        assert_eq!(channel.scheme(), crate::core_ids::ChannelScheme::Tagged);
    }
}
