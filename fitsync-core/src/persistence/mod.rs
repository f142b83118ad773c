//! Local key-value persistence for store snapshots
//!
//! Each key holds one JSON document wrapped in a versioned [`Envelope`].
//! A document written by a different format version, or one that fails to
//! parse, is treated as absent so the next resync rebuilds it.

mod file;
mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core_groups::types::Timestamp;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

/// Key under which the group store snapshot lives
pub const GROUPS_KEY: &str = "groups";

/// Key under which the identifier table lives
pub const GROUP_IDS_KEY: &str = "group_ids";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Byte-oriented key-value storage
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> PersistenceResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> PersistenceResult<()>;
    async fn remove(&self, key: &str) -> PersistenceResult<()>;
}

pub(crate) fn validate_key(key: &str) -> PersistenceResult<()> {
    let ok = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::InvalidKey(key.to_string()))
    }
}

/// Versioned wrapper around a persisted document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub saved_at: Timestamp,
    pub data: T,
}

/// Serialize `data` under `key` with the current format version
pub async fn save_versioned<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    data: &T,
) -> PersistenceResult<()> {
    #[derive(Serialize)]
    struct Borrowed<'a, T> {
        version: u32,
        saved_at: Timestamp,
        data: &'a T,
    }

    let bytes = serde_json::to_vec(&Borrowed {
        version: SNAPSHOT_VERSION,
        saved_at: Timestamp::now(),
        data,
    })?;
    store.put(key, bytes).await
}

/// Load the document under `key`; `None` when absent, stale-format or corrupt
pub async fn load_versioned<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> PersistenceResult<Option<Envelope<T>>> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };

    #[derive(Deserialize)]
    struct VersionProbe {
        version: u32,
    }

    match serde_json::from_slice::<VersionProbe>(&bytes) {
        Ok(probe) if probe.version != SNAPSHOT_VERSION => {
            warn!(key, found = probe.version, expected = SNAPSHOT_VERSION, "Discarding snapshot with foreign version");
            return Ok(None);
        }
        Ok(_) => {}
        Err(e) => {
            warn!(key, error = %e, "Discarding unreadable snapshot");
            return Ok(None);
        }
    }

    match serde_json::from_slice::<Envelope<T>>(&bytes) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(e) => {
            warn!(key, error = %e, "Discarding corrupt snapshot");
            Ok(None)
        }
    }
}
