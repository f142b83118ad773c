//! Group state: entities, errors and the reconciling store

pub mod errors;
pub mod store;
pub mod types;

pub use errors::{SyncError, SyncResult};
pub use store::{GroupMap, GroupStore, RehydrateReport, ResyncOptions, ResyncOutcome, ResyncReport};
pub use types::{
    temporary_group_id, Goal, Group, GroupDraft, GroupId, GroupOrigin, GroupPatch, MemberRole, Membership,
    Timestamp, UserId, UNKNOWN_CREATOR,
};
