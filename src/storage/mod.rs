//! Storage backends and the router that hands them out
//!
//! - **surface**: byte-level file access (local disk or in-memory)
//! - **file**: a storage holding the state trees of many components in one file
//! - **manager**: resolves storage specs to shared storage instances

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub mod file;
pub mod manager;
pub mod surface;

pub use file::FileStorage;
pub use manager::{ExternalizationSession, StateStorageManager, StorageFactory};
pub use surface::{FileSurface, LocalFileSurface, MemoryFileSurface};

/// Whether a storage's content is meant to follow the user across machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoamingType {
    #[default]
    Default,
    PerOs,
    Disabled,
}

/// A single named persistence target.
pub trait StateStorage: Send + Sync {
    /// Resolved (macro-expanded) file spec identifying this storage
    fn file_spec(&self) -> &str;

    fn roaming(&self) -> RoamingType;

    /// Whether state for `component` exists. `reload` forces a fresh read.
    fn has_state(&self, component: &str, reload: bool) -> Result<bool>;

    /// Stored state tree for `component`, macros expanded.
    fn get_state(&self, component: &str) -> Result<Option<Value>>;

    /// Begin collecting state for a save pass; `None` if the storage cannot be written.
    fn start_externalization(self: Arc<Self>) -> Option<Box<dyn StorageExternalization>>;

    /// Re-read the underlying file and report components whose state changed.
    fn analyze_external_changes(&self, changed: &mut BTreeSet<String>) -> Result<()>;
}

/// Per-storage half of an externalization session.
pub trait StorageExternalization: Send {
    fn set_state(&mut self, component: &str, state: Value);

    /// Finalize; `None` when nothing would change on disk and `force` is false.
    fn create_save_session(self: Box<Self>, force: bool) -> Option<Arc<dyn SaveSession>>;
}

/// Pending write of one storage.
pub trait SaveSession: Send + Sync {
    fn file_spec(&self) -> &str;

    /// Write the pending content. Read-only targets fail with
    /// [`StoreError::ReadOnlyModification`](crate::StoreError::ReadOnlyModification).
    fn save(&self) -> Result<()>;
}

impl fmt::Debug for dyn SaveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveSession")
            .field("file_spec", &self.file_spec())
            .finish()
    }
}

/// A save diverted because its target is read-only. Retry with `session.save()`.
#[derive(Debug, Clone)]
pub struct ReadOnlyTarget {
    pub session: Arc<dyn SaveSession>,
    pub file: String,
}

/// Optional remote-sync hook consulted by storages for roamable files.
pub trait StreamProvider: Send + Sync {
    fn is_applicable(&self, file_spec: &str, roaming: RoamingType) -> bool;

    fn read(&self, file_spec: &str, roaming: RoamingType) -> anyhow::Result<Option<Vec<u8>>>;

    fn write(&self, file_spec: &str, content: &[u8], roaming: RoamingType) -> anyhow::Result<()>;
}
