//! Storage router
//!
//! Maps the storage specs components declare to concrete, shared storage
//! instances. Specs are macro-expanded into file paths; one instance exists
//! per (path, roaming) pair so every component mapped to the same file goes
//! through the same storage.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    FileStorage, FileSurface, RoamingType, SaveSession, StateStorage, StorageExternalization,
    StreamProvider,
};
use crate::component::StorageSpec;
use crate::constants::macros::DELIMITER;
use crate::error::{Result, StoreError};
use crate::path_macros::{PathMacroSubstitutor, referenced_macros};

/// Collaborators every storage of one manager shares
pub struct StorageContext {
    surface: Arc<dyn FileSurface>,
    substitutor: Arc<PathMacroSubstitutor>,
    stream_provider: RwLock<Option<Arc<dyn StreamProvider>>>,
}

impl StorageContext {
    pub fn new(surface: Arc<dyn FileSurface>, substitutor: Arc<PathMacroSubstitutor>) -> Self {
        Self {
            surface,
            substitutor,
            stream_provider: RwLock::new(None),
        }
    }

    pub fn surface(&self) -> &dyn FileSurface {
        self.surface.as_ref()
    }

    pub fn substitutor(&self) -> &PathMacroSubstitutor {
        &self.substitutor
    }

    pub fn stream_provider(&self) -> Option<Arc<dyn StreamProvider>> {
        self.stream_provider.read().clone()
    }

    pub fn set_stream_provider(&self, provider: Option<Arc<dyn StreamProvider>>) {
        *self.stream_provider.write() = provider;
    }

    /// The stream provider, if it wants this file
    pub fn applicable_provider(
        &self,
        file_spec: &str,
        roaming: RoamingType,
    ) -> Option<Arc<dyn StreamProvider>> {
        if roaming == RoamingType::Disabled {
            return None;
        }
        self.stream_provider()
            .filter(|provider| provider.is_applicable(file_spec, roaming))
    }
}

/// Creates storage instances for resolved file specs.
pub trait StorageFactory: Send + Sync {
    /// `None` if the file spec cannot be served by any storage kind.
    fn create(
        &self,
        file_spec: &str,
        roaming: RoamingType,
        ctx: &Arc<StorageContext>,
    ) -> Option<Arc<dyn StateStorage>>;
}

/// Serves every fully expanded path with a [`FileStorage`]
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStorageFactory;

impl StorageFactory for FileStorageFactory {
    fn create(
        &self,
        file_spec: &str,
        roaming: RoamingType,
        ctx: &Arc<StorageContext>,
    ) -> Option<Arc<dyn StateStorage>> {
        if file_spec.trim().is_empty() || has_macro_token(file_spec) {
            return None;
        }
        Some(Arc::new(FileStorage::new(file_spec, roaming, ctx.clone())))
    }
}

fn has_macro_token(text: &str) -> bool {
    !referenced_macros(text).is_empty()
}

/// Resolves storage specs to cached storage instances.
pub struct StateStorageManager {
    ctx: Arc<StorageContext>,
    root_macro: String,
    factory: Box<dyn StorageFactory>,
    storages: RwLock<HashMap<(String, RoamingType), Arc<dyn StateStorage>>>,
    read_only: bool,
}

impl StateStorageManager {
    /// `root_macro` is prefixed to storage files that reference no macro.
    pub fn new(
        surface: Arc<dyn FileSurface>,
        substitutor: Arc<PathMacroSubstitutor>,
        root_macro: impl Into<String>,
    ) -> Self {
        Self {
            ctx: Arc::new(StorageContext::new(surface, substitutor)),
            root_macro: root_macro.into(),
            factory: Box::new(FileStorageFactory),
            storages: RwLock::new(HashMap::new()),
            read_only: false,
        }
    }

    pub fn with_factory(mut self, factory: impl StorageFactory + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    /// A read-only manager never starts externalization.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn context(&self) -> &Arc<StorageContext> {
        &self.ctx
    }

    pub fn macro_substitutor(&self) -> &PathMacroSubstitutor {
        self.ctx.substitutor()
    }

    /// Concrete path of a storage spec
    pub fn build_file_spec(&self, spec: &StorageSpec) -> String {
        let file = spec.file.trim_start_matches(['/', '\\']);
        let logical = if has_macro_token(&spec.file) {
            spec.file.clone()
        } else {
            format!("{DELIMITER}{}{DELIMITER}/{file}", self.root_macro)
        };
        self.expand_macros(&logical)
    }

    /// Shared storage instance for `spec`, created on first use.
    pub fn get_state_storage(&self, spec: &StorageSpec) -> Option<Arc<dyn StateStorage>> {
        let file_spec = self.build_file_spec(spec);
        let key = (file_spec, spec.roaming);
        if let Some(storage) = self.storages.read().get(&key) {
            return Some(storage.clone());
        }

        let mut storages = self.storages.write();
        if let Some(storage) = storages.get(&key) {
            return Some(storage.clone());
        }
        match self.factory.create(&key.0, spec.roaming, &self.ctx) {
            Some(storage) => {
                debug!(file = %key.0, roaming = ?spec.roaming, "Created state storage");
                storages.insert(key, storage.clone());
                Some(storage)
            }
            None => {
                error!(spec = %spec.file, file = %key.0, "Storage spec cannot be mapped to a storage");
                None
            }
        }
    }

    /// Every storage instance handed out so far
    pub fn cached_storages(&self) -> Vec<Arc<dyn StateStorage>> {
        self.storages.read().values().cloned().collect()
    }

    /// Force re-resolution of a file's storage on next lookup.
    pub fn clear_state_storage(&self, file_spec: &str) {
        let mut storages = self.storages.write();
        let before = storages.len();
        storages.retain(|(file, _), _| file != file_spec);
        debug!(file = %file_spec, dropped = before - storages.len(), "Cleared state storage");
    }

    /// `None` when nothing can be persisted through this manager.
    pub fn start_externalization(&self) -> Option<ExternalizationSession<'_>> {
        if self.read_only {
            return None;
        }
        Some(ExternalizationSession {
            manager: self,
            sessions: Vec::new(),
        })
    }

    /// Define a new macro, returning components that referenced it while unknown.
    pub fn add_macro(&self, name: &str, value: &str) -> Result<BTreeSet<String>> {
        let subst = self.ctx.substitutor();
        subst.add_macro(name, value)?;
        Ok(subst.invalidate_unknown_macros(&BTreeSet::from([name.to_string()])))
    }

    /// Overwrite a macro. Cached storages resolved through it are dropped.
    pub fn replace_macro(&self, name: &str, value: &str) -> Option<String> {
        let previous = self.ctx.substitutor().replace_macro(name, value);
        self.storages.write().clear();
        previous
    }

    pub fn expand_macros(&self, text: &str) -> String {
        self.ctx.substitutor().expand(text)
    }

    pub fn collapse_macros(&self, text: &str) -> String {
        self.ctx.substitutor().collapse(text)
    }

    pub fn set_stream_provider(&self, provider: Option<Arc<dyn StreamProvider>>) {
        self.ctx.set_stream_provider(provider);
    }

    pub fn stream_provider(&self) -> Option<Arc<dyn StreamProvider>> {
        self.ctx.stream_provider()
    }
}

/// One save pass shared by every component.
pub struct ExternalizationSession<'a> {
    manager: &'a StateStorageManager,
    sessions: Vec<(Arc<dyn StateStorage>, Box<dyn StorageExternalization>)>,
}

impl ExternalizationSession<'_> {
    /// Record `state` against the first writable storage of `specs`
    /// (expected in priority order).
    pub fn set_state(&mut self, specs: &[StorageSpec], component: &str, state: Value) -> Result<()> {
        for spec in specs {
            let Some(storage) = self.manager.get_state_storage(spec) else {
                continue;
            };
            if let Some((_, session)) = self
                .sessions
                .iter_mut()
                .find(|(s, _)| same_storage(s, &storage))
            {
                session.set_state(component, state);
                return Ok(());
            }
            match storage.clone().start_externalization() {
                Some(mut session) => {
                    session.set_state(component, state);
                    self.sessions.push((storage, session));
                    return Ok(());
                }
                None => {
                    warn!(component = %component, file = %storage.file_spec(), "Storage is not writable, trying next");
                }
            }
        }
        Err(StoreError::UnresolvableStorage(
            specs
                .iter()
                .map(|s| s.file.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    /// Finalize into one save session per storage with pending writes.
    pub fn create_save_sessions(self, force: bool) -> Vec<Arc<dyn SaveSession>> {
        self.sessions
            .into_iter()
            .filter_map(|(_, session)| session.create_save_session(force))
            .collect()
    }
}

pub(crate) fn same_storage(a: &Arc<dyn StateStorage>, b: &Arc<dyn StateStorage>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
