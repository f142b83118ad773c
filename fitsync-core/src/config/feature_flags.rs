//! Client capability flags
//!
//! These flags describe what the running client can rely on. The orchestrator
//! reads them once at start-up to pick its transport.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Capability and behaviour toggles for a sync client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Push channels are reliably available on this client
    pub push_channels: bool,

    /// Synthesize placeholder groups for orphaned identifier mappings
    pub virtual_groups: bool,

    /// Resync automatically when a stale snapshot is rehydrated
    pub resync_on_rehydrate: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            push_channels: true,
            virtual_groups: true,
            resync_on_rehydrate: true,
        }
    }
}

/// Thread-safe, shareable view over [`FeatureFlags`]
#[derive(Debug, Clone)]
pub struct FeatureManager {
    flags: Arc<RwLock<FeatureFlags>>,
}

impl FeatureManager {
    /// Create a new feature manager with default flags
    pub fn new() -> Self {
        Self::with_flags(FeatureFlags::default())
    }

    /// Create a new feature manager with custom flags
    pub fn with_flags(flags: FeatureFlags) -> Self {
        Self { flags: Arc::new(RwLock::new(flags)) }
    }

    fn read<T>(&self, f: impl FnOnce(&FeatureFlags) -> T) -> T {
        // A poisoned lock still holds valid flags; a panicking writer cannot
        // leave a bool half-written.
        let guard = self.flags.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Whether push channels can be relied upon
    pub fn push_channels_available(&self) -> bool {
        self.read(|f| f.push_channels)
    }

    /// Whether orphaned mappings should produce virtual groups
    pub fn virtual_groups_enabled(&self) -> bool {
        self.read(|f| f.virtual_groups)
    }

    /// Whether a stale rehydrated snapshot triggers a resync
    pub fn resync_on_rehydrate(&self) -> bool {
        self.read(|f| f.resync_on_rehydrate)
    }

    /// Report a change in push channel availability
    pub fn set_push_channels(&self, available: bool) {
        let mut guard = self.flags.write().unwrap_or_else(|e| e.into_inner());
        guard.push_channels = available;
    }

    /// Copy of the current flags
    pub fn snapshot(&self) -> FeatureFlags {
        self.read(|f| f.clone())
    }
}

impl Default for FeatureManager {
    fn default() -> Self {
        Self::new()
    }
}
