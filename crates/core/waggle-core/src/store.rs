//! State store abstraction
//!
//! The core keeps no persistent state. Components that opt into persistence
//! (the bus, router-style consumers) go through `StateStore`; the default
//! backend is in-memory, the file backend replaces its target atomically via
//! a temp-file rename.

use crate::error::{SwarmError, SwarmResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Load/save interface for component snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved snapshot, if any.
    async fn load(&self) -> SwarmResult<Option<serde_json::Value>>;

    /// Replace the stored snapshot.
    async fn save(&self, state: &serde_json::Value) -> SwarmResult<()>;
}

/// Default backend: a single in-memory slot.
pub struct InMemoryStateStore {
    slot: RwLock<Option<serde_json::Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> SwarmResult<Option<serde_json::Value>> {
        Ok(self.slot.read().await.clone())
    }

    async fn save(&self, state: &serde_json::Value) -> SwarmResult<()> {
        *self.slot.write().await = Some(state.clone());
        Ok(())
    }
}

/// File backend. Saves write a sibling temp file and rename it over the
/// target so a crash mid-save never leaves a torn snapshot.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> SwarmResult<Option<serde_json::Value>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SwarmError::Storage(format!("failed to read {:?}: {e}", self.path)))?;
        let value = serde_json::from_str(&contents)
            .map_err(|e| SwarmError::Storage(format!("failed to parse {:?}: {e}", self.path)))?;
        Ok(Some(value))
    }

    async fn save(&self, state: &serde_json::Value) -> SwarmResult<()> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|e| SwarmError::Storage(format!("failed to serialize state: {e}")))?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, serialized)
            .await
            .map_err(|e| SwarmError::Storage(format!("failed to write {temp:?}: {e}")))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| SwarmError::Storage(format!("failed to rename {temp:?}: {e}")))?;
        Ok(())
    }
}
