//! Push channel wire messages
//!
//! JSON objects tagged by `type`. Types this client does not know parse as
//! [`PushMessage::Unknown`] and are ignored.

use serde::{Deserialize, Serialize};

use crate::core_groups::types::{GroupId, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Subscribe {
        topic: String,
    },
    GroupUpdate {
        #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl PushMessage {
    pub const GROUPS_TOPIC: &'static str = "groups";

    pub fn subscribe_groups() -> Self {
        PushMessage::Subscribe { topic: Self::GROUPS_TOPIC.to_string() }
    }

    pub fn ping_now() -> Self {
        PushMessage::Ping { timestamp: Timestamp::now().0 }
    }

    /// `None` for anything that is not a JSON object with a `type`
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: no maps with non-string keys.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_group_update(&self) -> bool {
        matches!(self, PushMessage::GroupUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_wire_form() {
        assert_eq!(
            PushMessage::subscribe_groups().to_json(),
            r#"{"type":"subscribe","topic":"groups"}"#
        );
    }

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!(
            PushMessage::parse(r#"{"type":"group_update"}"#),
            Some(PushMessage::GroupUpdate { group_id: None })
        );
        assert_eq!(
            PushMessage::parse(r#"{"type":"group_update","groupId":57}"#),
            Some(PushMessage::GroupUpdate { group_id: Some(GroupId(57)) })
        );
        assert_eq!(PushMessage::parse(r#"{"type":"typing","user":3}"#), Some(PushMessage::Unknown));
        assert_eq!(PushMessage::parse("not json"), None);
    }

    #[test]
    fn test_ping_carries_timestamp() {
        let json = PushMessage::ping_now().to_json();
        let back = PushMessage::parse(&json).unwrap();
        assert!(matches!(back, PushMessage::Ping { timestamp } if timestamp > 0));
    }
}
