//! Shared fakes for store tests

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ComponentStore, StoreListener};
use crate::component::{PersistentStateComponent, StateSpec, StorageSpec};
use crate::defaults::{BundledResources, DefaultStateCache, ResourceProvider};
use crate::error::{Result, StoreError};
use crate::path_macros::PathMacroSubstitutor;
use crate::storage::{
    MemoryFileSurface, RoamingType, StateStorage, StateStorageManager, StorageExternalization,
};

pub const APP_ROOT: &str = "/home/tester/.config/app";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsState {
    pub enabled: bool,
    pub level: u32,
    #[serde(default)]
    pub dir: String,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 0,
            dir: String::new(),
        }
    }
}

/// Modification-tracked component counting its loads and state reads
#[derive(Debug, Default)]
pub struct Settings {
    state: Mutex<SettingsState>,
    modifications: AtomicU64,
    loads: AtomicUsize,
    reads: AtomicUsize,
}

impl Settings {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> SettingsState {
        self.state.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SettingsState)) {
        f(&mut *self.state.lock());
        self.modifications.fetch_add(1, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn modification_count(&self) -> u64 {
        self.modifications.load(Ordering::SeqCst)
    }
}

impl PersistentStateComponent for Settings {
    type State = SettingsState;
    const TRACKS_MODIFICATIONS: bool = true;

    fn get_state(&self) -> Option<SettingsState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Some(self.state())
    }

    fn load_state(&self, state: SettingsState) {
        *self.state.lock() = state;
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.modifications.fetch_add(1, Ordering::SeqCst);
    }

    fn state_modification_count(&self) -> u64 {
        self.modification_count()
    }
}

/// Untracked component holding a single value
#[derive(Debug, Default)]
pub struct Plain {
    pub value: Mutex<Value>,
}

impl Plain {
    pub fn new(value: Value) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
        })
    }
}

impl PersistentStateComponent for Plain {
    type State = Value;

    fn get_state(&self) -> Option<Value> {
        let value = self.value.lock().clone();
        (!value.is_null()).then_some(value)
    }

    fn load_state(&self, state: Value) {
        *self.value.lock() = state;
    }
}

/// `Foo` with a deprecated `other.json` and authoritative `foo.json`
pub fn foo_spec() -> StateSpec {
    StateSpec::new("Foo")
        .storage(StorageSpec::deprecated("other.json"))
        .storage(StorageSpec::new("foo.json"))
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    started: AtomicUsize,
    finished: AtomicUsize,
    save_failures: Mutex<Vec<String>>,
    plugin_faults: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn batches(&self) -> (usize, usize) {
        (
            self.started.load(Ordering::SeqCst),
            self.finished.load(Ordering::SeqCst),
        )
    }

    pub fn save_failures(&self) -> Vec<String> {
        self.save_failures.lock().clone()
    }

    pub fn plugin_faults(&self) -> Vec<String> {
        self.plugin_faults.lock().clone()
    }
}

impl StoreListener for RecordingListener {
    fn batch_update_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_update_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn save_failed(&self, error: &StoreError) {
        self.save_failures.lock().push(error.to_string());
    }

    fn plugin_fault(&self, plugin: &str, _error: &StoreError) {
        self.plugin_faults.lock().push(plugin.to_string());
    }
}

pub struct TestEnv {
    pub surface: Arc<MemoryFileSurface>,
    pub store: Arc<ComponentStore>,
    pub listener: Arc<RecordingListener>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_sandbox(false)
    }

    pub fn with_sandbox(sandbox: bool) -> Self {
        Self::on_surface(Arc::new(MemoryFileSurface::new()), sandbox)
    }

    /// A fresh store over an existing surface, as after a restart
    pub fn on_surface(surface: Arc<MemoryFileSurface>, sandbox: bool) -> Self {
        let subst = PathMacroSubstitutor::new(true);
        subst
            .add_macro("APP_CONFIG", APP_ROOT)
            .expect("fresh substitutor");
        let manager = StateStorageManager::new(surface.clone(), Arc::new(subst), "APP_CONFIG");
        let listener = Arc::new(RecordingListener::default());
        let store = ComponentStore::new(manager, Arc::new(DefaultStateCache::new()))
            .with_listener(listener.clone())
            .with_sandbox(sandbox);
        Self {
            surface,
            store: Arc::new(store),
            listener,
        }
    }

    pub fn path(&self, file: &str) -> String {
        format!("{APP_ROOT}/{file}")
    }

    /// Parsed storage document, or an empty one
    pub fn document(&self, file: &str) -> Value {
        self.surface
            .content(&self.path(file))
            .map(|bytes| serde_json::from_slice(&bytes).expect("valid document"))
            .unwrap_or_else(|| json!({"version": 1, "components": {}}))
    }

    /// State of `component` as currently stored in `file`
    pub fn stored(&self, file: &str, component: &str) -> Option<Value> {
        self.document(file)["components"]
            .get(component)
            .cloned()
    }

    /// Seed `file` with state for `component`, keeping other components
    pub fn put(&self, file: &str, component: &str, state: Value) {
        let mut doc = self.document(file);
        doc["components"][component] = state;
        self.surface
            .insert(&self.path(file), serde_json::to_vec(&doc).expect("serializable"));
    }
}

/// Resource provider counting reads
pub struct CountingResources {
    inner: BundledResources,
    reads: AtomicUsize,
}

impl CountingResources {
    pub fn new(inner: BundledResources) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ResourceProvider for CountingResources {
    fn scope_id(&self) -> &str {
        self.inner.scope_id()
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(path)
    }
}

/// Storage whose change analysis always fails
pub struct FailingStorage;

impl StateStorage for FailingStorage {
    fn file_spec(&self) -> &str {
        "/broken.json"
    }

    fn roaming(&self) -> RoamingType {
        RoamingType::Default
    }

    fn has_state(&self, _component: &str, _reload: bool) -> Result<bool> {
        Ok(false)
    }

    fn get_state(&self, _component: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn start_externalization(self: Arc<Self>) -> Option<Box<dyn StorageExternalization>> {
        None
    }

    fn analyze_external_changes(&self, _changed: &mut BTreeSet<String>) -> Result<()> {
        Err(StoreError::io(
            "/broken.json",
            io::Error::new(io::ErrorKind::Other, "disk on fire"),
        ))
    }
}
