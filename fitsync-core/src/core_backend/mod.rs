//! Boundary to the server of record
//!
//! The CRUD backend is a black box reached through [`GroupApi`]. The
//! production implementation speaks HTTP/JSON ([`HttpGroupApi`]); tests and
//! the harness use the in-memory backend in `test_harness`.

pub mod errors;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core_groups::types::{Goal, Group, GroupDraft, GroupId, GroupPatch, Membership, UserId};

pub use errors::{ApiError, ApiResult};
pub use http::HttpGroupApi;

/// Identifier table in wire form: `{ "<groupId>": "<channelId>" }`
pub type RawIdentifierTable = BTreeMap<String, String>;

/// Body of `POST /groups`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
    pub creator_id: UserId,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub admin_ids: Vec<UserId>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    /// Channel identifier the client generated for this group
    pub channel_id: String,
}

impl CreateGroupRequest {
    pub fn from_draft(draft: &GroupDraft, channel_id: impl Into<String>) -> Self {
        let shape = draft.to_group(GroupId(0));
        Self {
            name: shape.name,
            description: shape.description,
            image: shape.image,
            creator_id: shape.creator_id,
            participant_ids: shape.participant_ids,
            admin_ids: shape.admin_ids,
            goals: shape.goals,
            channel_id: channel_id.into(),
        }
    }
}

/// Operations the sync core consumes from the backend
#[async_trait]
pub trait GroupApi: Send + Sync {
    /// `GET /groups`
    async fn list_groups(&self) -> ApiResult<Vec<Group>>;

    /// `GET /groups/:id/members`
    async fn list_members(&self, group_id: GroupId) -> ApiResult<Vec<Membership>>;

    /// `POST /groups`
    async fn create_group(&self, request: &CreateGroupRequest) -> ApiResult<Group>;

    /// `PATCH /groups/:id`
    async fn update_group(&self, group_id: GroupId, patch: &GroupPatch) -> ApiResult<Group>;

    /// `DELETE /groups/:id`
    async fn delete_group(&self, group_id: GroupId) -> ApiResult<()>;

    /// `GET /group-ids`
    async fn fetch_identifiers(&self) -> ApiResult<RawIdentifierTable>;

    /// `DELETE /group-ids/:id`
    async fn delete_identifier(&self, group_id: GroupId) -> ApiResult<()>;

    /// `POST /group-ids/reset`; returns the regenerated table
    async fn reset_identifiers(&self) -> ApiResult<RawIdentifierTable>;
}
