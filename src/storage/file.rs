//! File storage: the state trees of many components in one document
//!
//! Document layout:
//!
//! ```json
//! { "version": 1, "components": { "Foo": { "enabled": true } } }
//! ```
//!
//! Trees are stored with path macros collapsed and handed out expanded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::manager::StorageContext;
use super::{RoamingType, SaveSession, StateStorage, StorageExternalization};
use crate::constants::storage::{COMPONENTS_KEY, FORMAT_VERSION, VERSION_KEY};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct StorageData {
    loaded: bool,
    states: BTreeMap<String, Value>,
}

/// A storage backed by a single file on a [`FileSurface`](super::FileSurface)
pub struct FileStorage {
    file_spec: String,
    roaming: RoamingType,
    ctx: Arc<StorageContext>,
    data: RwLock<StorageData>,
}

impl FileStorage {
    pub fn new(file_spec: impl Into<String>, roaming: RoamingType, ctx: Arc<StorageContext>) -> Self {
        Self {
            file_spec: file_spec.into(),
            roaming,
            ctx,
            data: RwLock::new(StorageData::default()),
        }
    }

    /// Raw bytes from the surface, falling back to the stream provider
    fn read_content(&self) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.ctx.surface().read(&self.file_spec)? {
            return Ok(Some(bytes));
        }
        let Some(provider) = self.ctx.applicable_provider(&self.file_spec, self.roaming) else {
            return Ok(None);
        };
        match provider.read(&self.file_spec, self.roaming) {
            Ok(bytes) => {
                if bytes.is_some() {
                    info!(file = %self.file_spec, "Read storage from stream provider");
                }
                Ok(bytes)
            }
            Err(e) => {
                warn!(file = %self.file_spec, error = %e, "Stream provider read failed");
                Ok(None)
            }
        }
    }

    fn read_states(&self) -> Result<BTreeMap<String, Value>> {
        match self.read_content()? {
            Some(bytes) => parse_document(&self.file_spec, &bytes),
            None => Ok(BTreeMap::new()),
        }
    }

    fn ensure_loaded(&self, reload: bool) -> Result<()> {
        if !reload && self.data.read().loaded {
            return Ok(());
        }
        let states = self.read_states()?;
        let mut data = self.data.write();
        debug!(file = %self.file_spec, components = states.len(), "Loaded storage");
        data.states = states;
        data.loaded = true;
        Ok(())
    }

    /// Merge `updates` into the current document and write it.
    ///
    /// The merge happens under the write lock so overlapping save passes on
    /// this file never drop each other's components.
    fn commit(&self, updates: &BTreeMap<String, Value>) -> Result<()> {
        let mut data = self.data.write();
        let mut merged = data.states.clone();
        merged.extend(updates.iter().map(|(name, state)| (name.clone(), state.clone())));
        let content = render_document(&merged);
        self.ctx.surface().write(&self.file_spec, &content)?;
        data.states = merged;
        data.loaded = true;
        drop(data);

        if let Some(provider) = self.ctx.applicable_provider(&self.file_spec, self.roaming) {
            if let Err(e) = provider.write(&self.file_spec, &content, self.roaming) {
                warn!(file = %self.file_spec, error = %e, "Stream provider write failed");
            }
        }
        info!(file = %self.file_spec, "Saved storage");
        Ok(())
    }
}

impl StateStorage for FileStorage {
    fn file_spec(&self) -> &str {
        &self.file_spec
    }

    fn roaming(&self) -> RoamingType {
        self.roaming
    }

    fn has_state(&self, component: &str, reload: bool) -> Result<bool> {
        self.ensure_loaded(reload)?;
        Ok(self.data.read().states.contains_key(component))
    }

    fn get_state(&self, component: &str) -> Result<Option<Value>> {
        self.ensure_loaded(false)?;
        let Some(mut tree) = self.data.read().states.get(component).cloned() else {
            return Ok(None);
        };
        self.ctx.substitutor().expand_tree_for(component, &mut tree);
        Ok(Some(tree))
    }

    fn start_externalization(self: Arc<Self>) -> Option<Box<dyn StorageExternalization>> {
        Some(Box::new(FileExternalization {
            storage: self,
            updates: BTreeMap::new(),
        }))
    }

    fn analyze_external_changes(&self, changed: &mut BTreeSet<String>) -> Result<()> {
        let fresh = self.read_states()?;
        let mut data = self.data.write();
        if data.loaded {
            let names: BTreeSet<&String> = data.states.keys().chain(fresh.keys()).collect();
            for name in names {
                if data.states.get(name) != fresh.get(name) {
                    changed.insert(name.clone());
                }
            }
        }
        data.states = fresh;
        data.loaded = true;
        Ok(())
    }
}

struct FileExternalization {
    storage: Arc<FileStorage>,
    updates: BTreeMap<String, Value>,
}

impl StorageExternalization for FileExternalization {
    fn set_state(&mut self, component: &str, mut state: Value) {
        self.storage.ctx.substitutor().collapse_tree(&mut state);
        self.updates.insert(component.to_string(), state);
    }

    fn create_save_session(self: Box<Self>, force: bool) -> Option<Arc<dyn SaveSession>> {
        if let Err(e) = self.storage.ensure_loaded(false) {
            error!(file = %self.storage.file_spec, error = %e, "Cannot read storage before save, overwriting");
        }
        let unchanged = {
            let data = self.storage.data.read();
            self.updates
                .iter()
                .all(|(name, state)| data.states.get(name) == Some(state))
        };
        if !force && unchanged {
            debug!(file = %self.storage.file_spec, "Storage unchanged, skipping save");
            return None;
        }
        Some(Arc::new(FileSaveSession {
            storage: self.storage,
            updates: self.updates,
        }))
    }
}

struct FileSaveSession {
    storage: Arc<FileStorage>,
    updates: BTreeMap<String, Value>,
}

impl SaveSession for FileSaveSession {
    fn file_spec(&self) -> &str {
        &self.storage.file_spec
    }

    fn save(&self) -> Result<()> {
        self.storage.commit(&self.updates)
    }
}

fn parse_document(file: &str, bytes: &[u8]) -> Result<BTreeMap<String, Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    let corrupted = |source: serde_json::Error| StoreError::CorruptedStorage {
        file: file.to_string(),
        source,
    };
    let document: Value = serde_json::from_slice(bytes).map_err(corrupted)?;
    let components = match document.get(COMPONENTS_KEY) {
        Some(Value::Object(map)) => map.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(_) => {
            return Err(corrupted(serde::de::Error::custom(format!(
                "'{COMPONENTS_KEY}' must be an object"
            ))));
        }
    };
    Ok(components.into_iter().collect())
}

fn render_document(states: &BTreeMap<String, Value>) -> Vec<u8> {
    let mut document = Map::new();
    document.insert(VERSION_KEY.to_string(), Value::from(FORMAT_VERSION));
    document.insert(
        COMPONENTS_KEY.to_string(),
        Value::Object(states.clone().into_iter().collect()),
    );
    let mut bytes = serde_json::to_vec_pretty(&Value::Object(document)).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}
