//! Addressing a chat conversation

use serde::{Deserialize, Serialize};

use super::channel_id::ChannelId;
use super::table::IdentifierTable;
use crate::core_groups::types::{GroupId, UserId};

const DIRECT_PREFIX: &str = "direct-";

/// Either a one-to-one conversation or a group conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ChatTarget {
    Direct { user_id: UserId },
    Group { group_id: GroupId },
}

impl ChatTarget {
    /// Channel keying this conversation's messages
    pub fn channel(&self, ids: &IdentifierTable) -> ChannelId {
        match self {
            ChatTarget::Direct { user_id } => ChannelId::new(format!("{}{}", DIRECT_PREFIX, user_id)),
            ChatTarget::Group { group_id } => ids.resolve(*group_id),
        }
    }

    /// Inverse of [`ChatTarget::channel`]
    pub fn from_channel(channel: &ChannelId, ids: &IdentifierTable) -> Option<Self> {
        if let Some(user) = channel.as_str().strip_prefix(DIRECT_PREFIX) {
            return user.parse().ok().map(|id| ChatTarget::Direct { user_id: UserId(id) });
        }
        ids.reverse_resolve(channel).map(|group_id| ChatTarget::Group { group_id })
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChatTarget::Group { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_and_group_channels() {
        let ids = IdentifierTable::new();
        ids.register(GroupId(7), ChannelId::new("group-uuid-abc123"));

        let direct = ChatTarget::Direct { user_id: UserId(3) };
        let group = ChatTarget::Group { group_id: GroupId(7) };

        assert_eq!(direct.channel(&ids).as_str(), "direct-3");
        assert_eq!(group.channel(&ids).as_str(), "group-uuid-abc123");
        assert_eq!(ChatTarget::from_channel(&group.channel(&ids), &ids), Some(group));
        assert_eq!(ChatTarget::from_channel(&direct.channel(&ids), &ids), Some(direct));
    }

    #[test]
    fn test_wire_form() {
        let json = serde_json::to_value(ChatTarget::Group { group_id: GroupId(7) }).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "group", "groupId": 7 }));

        let parsed: ChatTarget = serde_json::from_str(r#"{"kind":"direct","userId":4}"#).unwrap();
        assert_eq!(parsed, ChatTarget::Direct { user_id: UserId(4) });
    }
}
