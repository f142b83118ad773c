//! Custom assertions for group state

use std::collections::BTreeMap;

use crate::core_groups::types::{Group, GroupId};

/// Assert the creator/participant/admin invariants on one group
pub fn assert_roster_invariants(group: &Group) {
    assert!(
        group.participant_ids.contains(&group.creator_id),
        "group {} creator {} missing from participants {:?}",
        group.id,
        group.creator_id,
        group.participant_ids
    );
    assert!(
        group.admin_ids.contains(&group.creator_id),
        "group {} creator {} missing from admins {:?}",
        group.id,
        group.creator_id,
        group.admin_ids
    );
    for admin in &group.admin_ids {
        assert!(group.participant_ids.contains(admin), "group {} admin {} is not a participant", group.id, admin);
    }
    let mut seen = std::collections::HashSet::new();
    assert!(
        group.participant_ids.iter().all(|id| seen.insert(*id)),
        "group {} has duplicate participants {:?}",
        group.id,
        group.participant_ids
    );
}

/// Assert two group collections hold the same ids, names and rosters
pub fn assert_same_groups(actual: &[Group], expected: &[Group]) {
    fn index(groups: &[Group]) -> BTreeMap<GroupId, (&str, Vec<u64>)> {
        groups
            .iter()
            .map(|g| {
                let mut members: Vec<u64> = g.participant_ids.iter().map(|u| u.0).collect();
                members.sort_unstable();
                (g.id, (g.name.as_str(), members))
            })
            .collect()
    }
    assert_eq!(index(actual), index(expected));
}

/// Assert that a Result is Ok and return the value
pub fn assert_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}
