//! Group entities as the store holds them
//!
//! `Group` doubles as the wire record: it serializes in the backend's
//! camelCase form, and the local-only [`GroupOrigin`] tag is never sent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Server-assigned numeric group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(GroupId)
    }
}

/// Numeric user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(unix_duration().as_millis() as u64)
    }

    /// Time elapsed since this timestamp, zero if it lies in the future
    pub fn age(&self) -> std::time::Duration {
        std::time::Duration::from_millis(Self::now().0.saturating_sub(self.0))
    }
}

fn unix_duration() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

static LAST_TEMPORARY_ID: AtomicU64 = AtomicU64::new(0);

/// Temporary id for an optimistic insert
///
/// Unix microseconds, strictly increasing within the process. Values are far
/// above any server-assigned id.
pub fn temporary_group_id() -> GroupId {
    let now = unix_duration().as_micros() as u64;
    let prev = LAST_TEMPORARY_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
        .unwrap_or_else(|last| last);
    GroupId(now.max(prev + 1))
}

/// Where a stored entry came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupOrigin {
    /// Returned by the server of record
    #[default]
    Server,
    /// Local mutation not yet confirmed
    Optimistic,
    /// Synthesized for an identifier mapping with no group record
    Virtual,
}

/// Goal attached to a group (distance, sessions, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub progress: f64,
}

/// A group as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub admin_ids: Vec<UserId>,
    pub creator_id: UserId,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(skip)]
    pub origin: GroupOrigin,
}

/// Creator recorded on a virtual group whose roster names nobody
pub const UNKNOWN_CREATOR: UserId = UserId(0);

fn dedup_in_order(ids: &mut Vec<UserId>) {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.retain(|id| seen.insert(*id));
}

impl Group {
    /// Placeholder for a mapped id whose record is missing
    pub fn virtual_placeholder(id: GroupId, creator_id: UserId) -> Self {
        let digits = id.0.to_string();
        let tail = &digits[digits.len().saturating_sub(4)..];
        let mut group = Self {
            id,
            name: format!("Group {}", tail),
            description: String::new(),
            image: None,
            participant_ids: Vec::new(),
            admin_ids: Vec::new(),
            creator_id,
            created_at: Timestamp::default(),
            goals: Vec::new(),
            origin: GroupOrigin::Virtual,
        };
        group.normalize();
        group
    }

    /// Enforce the roster invariants in place
    ///
    /// Creator is both participant and admin, lists are duplicate-free in
    /// first-seen order, and every admin is a participant. A virtual group
    /// still waiting for a creator gets no placeholder member.
    pub fn normalize(&mut self) {
        if !self.has_unknown_creator() {
            if !self.participant_ids.contains(&self.creator_id) {
                self.participant_ids.insert(0, self.creator_id);
            }
            if !self.admin_ids.contains(&self.creator_id) {
                self.admin_ids.insert(0, self.creator_id);
            }
        }
        dedup_in_order(&mut self.participant_ids);
        dedup_in_order(&mut self.admin_ids);
        for admin in &self.admin_ids {
            if !self.participant_ids.contains(admin) {
                self.participant_ids.push(*admin);
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    pub fn with_origin(mut self, origin: GroupOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_virtual(&self) -> bool {
        self.origin == GroupOrigin::Virtual
    }

    /// Virtual group whose roster has not named anyone yet
    pub fn has_unknown_creator(&self) -> bool {
        self.is_virtual() && self.creator_id == UNKNOWN_CREATOR
    }

    pub fn is_optimistic(&self) -> bool {
        self.origin == GroupOrigin::Optimistic
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.participant_ids.contains(&user_id)
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_ids.contains(&user_id)
    }

    /// Fold a fetched roster into the participant and admin lists
    pub fn merge_roster(&mut self, roster: &[Membership]) {
        for member in roster.iter().filter(|m| m.group_id == self.id) {
            self.participant_ids.push(member.user_id);
            if member.role == MemberRole::Admin {
                self.admin_ids.push(member.user_id);
            }
        }
        self.normalize();
    }

    /// Apply a patch locally
    pub fn apply_patch(&mut self, patch: &GroupPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(image) = &patch.image {
            self.image = image.clone();
        }
        if let Some(participants) = &patch.participant_ids {
            self.participant_ids = participants.clone();
        }
        if let Some(admins) = &patch.admin_ids {
            self.admin_ids = admins.clone();
        }
        if let Some(goals) = &patch.goals {
            self.goals = goals.clone();
        }
        self.normalize();
    }
}

/// Input for `GroupStore::create`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDraft {
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub creator_id: UserId,
    pub participant_ids: Vec<UserId>,
    pub goals: Vec<Goal>,
}

impl GroupDraft {
    pub fn new(name: impl Into<String>, creator_id: UserId) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            image: None,
            creator_id,
            participant_ids: Vec::new(),
            goals: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_participants(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.participant_ids = ids.into_iter().map(UserId).collect();
        self
    }

    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goals.push(goal);
        self
    }

    /// The entity inserted optimistically under `id`
    pub fn to_group(&self, id: GroupId) -> Group {
        Group {
            id,
            name: self.name.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
            participant_ids: self.participant_ids.clone(),
            admin_ids: vec![self.creator_id],
            creator_id: self.creator_id,
            created_at: Timestamp::now(),
            goals: self.goals.clone(),
            origin: GroupOrigin::Optimistic,
        }
        .normalized()
    }
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `Some(None)` clears the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<Vec<Goal>>,
}

impl GroupPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Default::default() }
    }
}

/// Role within a group roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

/// One roster row from `GET /groups/:id/members`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: MemberRole,
}
