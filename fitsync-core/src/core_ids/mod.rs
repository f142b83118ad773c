//! Identifier reconciliation
//!
//! Maps numeric group ids to chat channel ids while legacy and tagged
//! identifiers coexist. `resolve` is total: an unmapped group still gets a
//! navigable legacy identifier.

pub mod channel_id;
pub mod chat_target;
pub mod errors;
pub mod table;

pub use channel_id::{ChannelId, ChannelScheme};
pub use chat_target::ChatTarget;
pub use errors::{IdsError, IdsResult};
pub use table::IdentifierTable;
