//! Chat channel identifiers
//!
//! Two schemes coexist: the legacy positional `group-<id>` form and the
//! tagged `group-uuid-<unix ms>-<12 hex>-<crc32 hex>` form. Anything else the
//! server hands back is carried verbatim.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core_groups::types::{GroupId, Timestamp};

const LEGACY_PREFIX: &str = "group-";
const TAGGED_PREFIX: &str = "group-uuid-";

/// Opaque channel identifier keying chat storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

/// Which identifier scheme a [`ChannelId`] follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelScheme {
    Legacy(GroupId),
    Tagged,
    Opaque,
}

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        ChannelId(value.into())
    }

    /// Positional identifier for a group
    pub fn legacy_for(group_id: GroupId) -> Self {
        ChannelId(format!("{}{}", LEGACY_PREFIX, group_id))
    }

    /// Fresh tagged identifier for a group being created
    pub fn generate_tagged() -> Self {
        Self::generate_tagged_with(&mut rand::rng(), Timestamp::now())
    }

    /// Tagged identifier from an explicit random source and clock reading
    pub fn generate_tagged_with<R: Rng + ?Sized>(rng: &mut R, at: Timestamp) -> Self {
        let random = rng.random::<u64>() & 0xffff_ffff_ffff;
        let body = format!("{}-{:012x}", at.0, random);
        let checksum = crc32fast::hash(body.as_bytes());
        ChannelId(format!("{}{}-{:08x}", TAGGED_PREFIX, body, checksum))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn scheme(&self) -> ChannelScheme {
        if let Some(id) = self.legacy_group_id() {
            ChannelScheme::Legacy(id)
        } else if self.has_valid_tag() {
            ChannelScheme::Tagged
        } else {
            ChannelScheme::Opaque
        }
    }

    /// Group id encoded in a legacy identifier
    pub fn legacy_group_id(&self) -> Option<GroupId> {
        let digits = self.0.strip_prefix(LEGACY_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(GroupId)
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy_group_id().is_some()
    }

    fn has_valid_tag(&self) -> bool {
        let Some(rest) = self.0.strip_prefix(TAGGED_PREFIX) else {
            return false;
        };
        let Some((body, checksum)) = rest.rsplit_once('-') else {
            return false;
        };
        let Some((ts, random)) = body.split_once('-') else {
            return false;
        };

        let is_hex = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        };
        !ts.is_empty()
            && ts.bytes().all(|b| b.is_ascii_digit())
            && is_hex(random, 12)
            && is_hex(checksum, 8)
            && format!("{:08x}", crc32fast::hash(body.as_bytes())) == checksum
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        ChannelId(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        ChannelId(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_legacy_round_trip() {
        let id = ChannelId::legacy_for(GroupId(57));
        assert_eq!(id.as_str(), "group-57");
        assert_eq!(id.scheme(), ChannelScheme::Legacy(GroupId(57)));
    }

    #[test]
    fn test_legacy_rejects_non_digits() {
        assert_eq!(ChannelId::new("group-").legacy_group_id(), None);
        assert_eq!(ChannelId::new("group-12a").legacy_group_id(), None);
        assert_eq!(ChannelId::new("group-uuid-abc123").legacy_group_id(), None);
        assert_eq!(ChannelId::new("group-99999999999999999999999").legacy_group_id(), None);
    }

    #[test]
    fn test_generated_tag_is_valid() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = ChannelId::generate_tagged_with(&mut rng, Timestamp(1_700_000_000_000));

        assert!(id.as_str().starts_with("group-uuid-1700000000000-"));
        assert_eq!(id.scheme(), ChannelScheme::Tagged);
    }

    #[test]
    fn test_tampered_tag_is_opaque() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = ChannelId::generate_tagged_with(&mut rng, Timestamp(1_700_000_000_000));
        let tampered = id.as_str().replacen("1700000000000", "1700000000001", 1);

        assert_eq!(ChannelId::new(tampered).scheme(), ChannelScheme::Opaque);
        assert_eq!(ChannelId::new("group-uuid-abc123").scheme(), ChannelScheme::Opaque);
    }

    #[test]
    fn test_generated_tags_differ() {
        assert_ne!(ChannelId::generate_tagged(), ChannelId::generate_tagged());
    }
}
