//! Component store: registration, load, external reload
//!
//! The store owns every registered component of one persistence scope. It
//! loads state through the storage router (falling back to bundled
//! defaults), saves all components through one externalization session per
//! pass (see [`save`]), and reinitializes only the components whose storages
//! changed on disk.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::component::{
    Capabilities, PersistentStateComponent, PlainAdapter, SettingsSavingComponent, StateSpec,
    StorageSpec, StoredComponent, UiBridgedAdapter, UiStateBridge,
};
use crate::config::StoreConfig;
use crate::defaults::DefaultStateCache;
use crate::error::{Result, StoreError};
use crate::path_macros::PathMacroSubstitutor;
use crate::storage::manager::same_storage;
use crate::storage::{LocalFileSurface, StateStorage, StateStorageManager};

pub mod save;

#[cfg(test)]
mod fixtures;

pub use save::{ChannelUiExecutor, InlineUiExecutor, SaveToken, UiExecutor, UiTaskReceiver};

/// Notifications published by the store
pub trait StoreListener: Send + Sync {
    fn batch_update_started(&self) {}

    fn batch_update_finished(&self) {}

    /// A full save pass failed; called once per pass.
    fn save_failed(&self, _error: &StoreError) {}

    /// A failure attributable to a plugin. The host may disable the plugin.
    fn plugin_fault(&self, _plugin: &str, _error: &StoreError) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl StoreListener for NoopListener {}

/// A component registered under its declared name.
pub struct RegisteredComponent {
    name: String,
    spec: StateSpec,
    sorted_storages: Vec<StorageSpec>,
    capabilities: Capabilities,
    component: Arc<dyn StoredComponent>,
}

impl RegisteredComponent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &StateSpec {
        &self.spec
    }

    /// Storages in load/save priority order
    pub fn storages(&self) -> &[StorageSpec] {
        &self.sorted_storages
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl std::fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("name", &self.name)
            .field("storages", &self.sorted_storages)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Which storages must be re-read instead of trusting their cache
enum Reload<'a> {
    No,
    All,
    Storages(&'a [Arc<dyn StateStorage>]),
}

impl Reload<'_> {
    fn forces(&self, storage: &Arc<dyn StateStorage>) -> bool {
        match self {
            Reload::No => false,
            Reload::All => true,
            Reload::Storages(changed) => changed.iter().any(|c| same_storage(c, storage)),
        }
    }
}

/// Persistence coordinator for one scope (application, project or module)
pub struct ComponentStore {
    manager: StateStorageManager,
    defaults: Arc<DefaultStateCache>,
    components: RwLock<BTreeMap<String, Arc<RegisteredComponent>>>,
    watermarks: RwLock<HashMap<String, u64>>,
    settings_saving: RwLock<Vec<Arc<dyn SettingsSavingComponent>>>,
    listener: Arc<dyn StoreListener>,
    /// Names claimed by registrations still loading, with the claiming instance
    loading: Mutex<HashMap<String, usize>>,
    active_saves: Mutex<HashSet<u64>>,
    sandbox: bool,
}

/// Releases a registration's name claim on drop
struct LoadingClaim<'a> {
    store: &'a ComponentStore,
    name: String,
}

impl Drop for LoadingClaim<'_> {
    fn drop(&mut self) {
        self.store.loading.lock().remove(&self.name);
    }
}

impl ComponentStore {
    pub fn new(manager: StateStorageManager, defaults: Arc<DefaultStateCache>) -> Self {
        Self {
            manager,
            defaults,
            components: RwLock::new(BTreeMap::new()),
            watermarks: RwLock::new(HashMap::new()),
            settings_saving: RwLock::new(Vec::new()),
            listener: Arc::new(NoopListener),
            loading: Mutex::new(HashMap::new()),
            active_saves: Mutex::new(HashSet::new()),
            sandbox: false,
        }
    }

    /// Store on the local disk as described by `config`.
    pub fn from_config(config: &StoreConfig, defaults: Arc<DefaultStateCache>) -> Result<Self> {
        let case_sensitive = config
            .case_sensitive
            .unwrap_or_else(crate::path_macros::host_case_sensitive);
        let substitutor = PathMacroSubstitutor::with_table(config.macro_table()?, case_sensitive);
        let surface = Arc::new(LocalFileSurface::new(&config.root_dir));
        let manager = StateStorageManager::new(
            surface,
            Arc::new(substitutor),
            config.scope.root_macro(),
        );
        info!(scope = ?config.scope, root = %config.root_dir.display(), "Created component store");
        Ok(Self::new(manager, defaults).with_sandbox(config.sandbox))
    }

    pub fn with_listener(mut self, listener: Arc<dyn StoreListener>) -> Self {
        self.listener = listener;
        self
    }

    /// In sandbox mode plugin faults are logged but never reported for disabling.
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn storage_manager(&self) -> &StateStorageManager {
        &self.manager
    }

    pub fn default_state_cache(&self) -> &Arc<DefaultStateCache> {
        &self.defaults
    }

    /// Register `instance` under its declared name and load its state.
    ///
    /// Returns `Ok(None)` when a different instance already owns the name.
    pub fn load_state_if_storable<C: PersistentStateComponent>(
        &self,
        instance: Arc<C>,
        spec: StateSpec,
    ) -> Result<Option<Arc<RegisteredComponent>>> {
        self.register(Arc::new(PlainAdapter(instance)), spec)
    }

    /// Like [`load_state_if_storable`](Self::load_state_if_storable) for components
    /// whose state is read from widgets.
    pub fn load_state_if_storable_with_ui<C: UiStateBridge>(
        &self,
        instance: Arc<C>,
        spec: StateSpec,
    ) -> Result<Option<Arc<RegisteredComponent>>> {
        self.register(Arc::new(UiBridgedAdapter(instance)), spec)
    }

    pub fn add_settings_saving_component(&self, component: Arc<dyn SettingsSavingComponent>) {
        self.settings_saving.write().push(component);
    }

    fn register(
        &self,
        component: Arc<dyn StoredComponent>,
        spec: StateSpec,
    ) -> Result<Option<Arc<RegisteredComponent>>> {
        if let Err(e) = spec.validate() {
            error!(component = %spec.name, plugin = ?spec.plugin, error = %e, "Invalid state declaration");
            self.report_plugin_fault(&e);
            return Err(e);
        }

        let _claim = match self.claim_name(&spec.name, component.as_ref()) {
            Ok(claim) => claim,
            Err(existing) => return Ok(existing),
        };

        let record = Arc::new(RegisteredComponent {
            name: spec.name.clone(),
            sorted_storages: spec.sorted_storages(),
            capabilities: component.capabilities(),
            spec,
            component,
        });

        match self.load_component(&record, &Reload::No) {
            Ok(loaded) => {
                debug!(component = %record.name, loaded = loaded, "Initialized component");
            }
            Err(e) if e.propagates_from_load() => return Err(e),
            Err(e) => {
                error!(component = %record.name, error = %e, "Cannot load component state");
            }
        }

        self.components
            .write()
            .insert(record.name.clone(), record.clone());
        Ok(Some(record))
    }

    /// Reserve `name` for `candidate` until its load finishes.
    ///
    /// `Err` carries the outcome when the name is already taken: the existing
    /// record for the same instance, `None` for a different one.
    fn claim_name(
        &self,
        name: &str,
        candidate: &dyn StoredComponent,
    ) -> std::result::Result<LoadingClaim<'_>, Option<Arc<RegisteredComponent>>> {
        let mut loading = self.loading.lock();
        if let Some(existing) = self.components.read().get(name) {
            return Err(self.resolve_conflict(existing, candidate));
        }
        if let Some(&owner) = loading.get(name) {
            if owner != candidate.instance_id() {
                error!(component = %name, "Conflicting component name, keeping the instance being loaded");
            }
            return Err(None);
        }
        loading.insert(name.to_string(), candidate.instance_id());
        Ok(LoadingClaim {
            store: self,
            name: name.to_string(),
        })
    }

    fn resolve_conflict(
        &self,
        existing: &Arc<RegisteredComponent>,
        candidate: &dyn StoredComponent,
    ) -> Option<Arc<RegisteredComponent>> {
        if existing.component.instance_id() == candidate.instance_id() {
            return Some(existing.clone());
        }
        error!(component = %existing.name, "Conflicting component name, keeping the registered instance");
        None
    }

    /// Apply stored state (or the bundled default) to one component.
    fn load_component(&self, record: &RegisteredComponent, reload: &Reload<'_>) -> Result<bool> {
        let name = record.name.as_str();
        for spec in &record.sorted_storages {
            let Some(storage) = self.manager.get_state_storage(spec) else {
                continue;
            };
            if !storage.has_state(name, reload.forces(&storage))? {
                continue;
            }
            if let Some(tree) = storage.get_state(name)? {
                record.component.load_tree(name, tree)?;
                self.update_watermark(record);
                debug!(component = %name, file = %storage.file_spec(), "Loaded component state");
                return Ok(true);
            }
        }

        let Some(default) = &record.spec.default_state else {
            return Ok(false);
        };
        let subst = self.manager.macro_substitutor();
        let path = subst.expand_for(name, &default.path);
        let Some(mut tree) = self.defaults.find(default.scope.as_ref(), &path)? else {
            return Ok(false);
        };
        subst.expand_tree_for(name, &mut tree);
        record.component.load_tree(name, tree)?;
        self.update_watermark(record);
        debug!(component = %name, resource = %path, "Loaded default component state");
        Ok(true)
    }

    fn update_watermark(&self, record: &RegisteredComponent) {
        if record.capabilities.modification_tracked {
            let count = record.component.modification_count();
            self.watermarks.write().insert(record.name.clone(), count);
        }
    }

    /// Re-read changed storages and reinitialize the components they affect.
    ///
    /// Returns whether any component was reinitialized.
    pub fn reload(&self, changed: &[Arc<dyn StateStorage>]) -> Result<bool> {
        let mut names = BTreeSet::new();
        for storage in changed {
            if let Err(e) = storage.analyze_external_changes(&mut names) {
                warn!(file = %storage.file_spec(), error = %e, "Cannot analyze external changes");
            }
        }
        {
            let components = self.components.read();
            names.retain(|name| components.contains_key(name));
        }
        if names.is_empty() {
            return Ok(false);
        }

        info!(components = ?names, "Reloading externally changed components");
        let reinitialized = self.in_batch_update(|| self.reinit(&names, &Reload::Storages(changed)))?;
        Ok(reinitialized > 0)
    }

    /// Reinitialize components by name. `reload_data` bypasses storage caches.
    pub fn reinit_components(&self, names: &BTreeSet<String>, reload_data: bool) -> Result<()> {
        let reload = if reload_data { Reload::All } else { Reload::No };
        self.in_batch_update(|| self.reinit(names, &reload))?;
        Ok(())
    }

    /// Define a macro and reinitialize the components that were missing it.
    pub fn define_macro(&self, name: &str, value: &str) -> Result<BTreeSet<String>> {
        let mut affected = self.manager.add_macro(name, value)?;
        {
            let components = self.components.read();
            affected.retain(|component| components.contains_key(component));
        }
        if !affected.is_empty() {
            info!(name = %name, components = ?affected, "Macro defined, reinitializing components");
            self.reinit_components(&affected, true)?;
        }
        Ok(affected)
    }

    fn in_batch_update<T>(&self, f: impl FnOnce() -> T) -> T {
        self.listener.batch_update_started();
        let result = f();
        self.listener.batch_update_finished();
        result
    }

    fn reinit(&self, names: &BTreeSet<String>, reload: &Reload<'_>) -> Result<usize> {
        let mut reinitialized = 0;
        let mut first_error = None;
        for name in names {
            let Some(record) = self.get_component(name) else {
                continue;
            };
            match self.load_component(&record, reload) {
                Ok(_) => reinitialized += 1,
                Err(e) if e.propagates_from_load() => {
                    error!(component = %name, error = %e, "Cannot reinitialize component");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(component = %name, error = %e, "Cannot reinitialize component");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reinitialized),
        }
    }

    pub fn get_component(&self, name: &str) -> Option<Arc<RegisteredComponent>> {
        self.components.read().get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.components.read().contains_key(name)
    }

    /// Registered names in save order
    pub fn component_names(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }

    /// Unresolved macros of one component, or of all when `None`
    pub fn unknown_macros(&self, component: Option<&str>) -> BTreeSet<String> {
        self.manager.macro_substitutor().get_unknown_macros(component)
    }

    pub(crate) fn watermark(&self, name: &str) -> Option<u64> {
        self.watermarks.read().get(name).copied()
    }

    fn report_plugin_fault(&self, error: &StoreError) {
        let Some(plugin) = error.plugin() else {
            return;
        };
        if self.sandbox {
            warn!(plugin = %plugin, error = %error, "Plugin fault ignored in sandbox mode");
            return;
        }
        self.listener.plugin_fault(plugin, error);
    }

    /// Forget every registered component.
    pub fn dispose(&self) {
        let count = {
            let mut components = self.components.write();
            let count = components.len();
            components.clear();
            count
        };
        self.watermarks.write().clear();
        self.settings_saving.write().clear();
        info!(components = count, "Disposed component store");
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::component::StorageSpec;
    use crate::defaults::BundledResources;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_load_prefers_authoritative_storage() {
        let env = TestEnv::new();
        env.put("other.json", "Foo", json!({"enabled": false, "level": 1}));
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 2}));

        let foo = Settings::new();
        env.store
            .load_state_if_storable(foo.clone(), foo_spec())
            .unwrap()
            .unwrap();
        assert_eq!(foo.state().level, 2);
        assert_eq!(foo.load_count(), 1);
    }

    #[test]
    fn test_load_falls_back_to_deprecated_storage() {
        let env = TestEnv::new();
        env.put("other.json", "Foo", json!({"enabled": false, "level": 1}));

        let foo = Settings::new();
        env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();
        assert_eq!(foo.state().level, 1);
        assert!(!foo.state().enabled);
    }

    #[test]
    fn test_default_state_loaded_once_for_many_components() {
        let env = TestEnv::new();
        let resources = Arc::new(CountingResources::new(
            BundledResources::new("plugin").with("/defaults/Shared.json", r#"{"enabled": true, "level": 7}"#),
        ));

        let instances: Vec<_> = (0..4).map(|_| Settings::new()).collect();
        for (i, instance) in instances.iter().enumerate() {
            let spec = StateSpec::new(format!("C{i}"))
                .storage(StorageSpec::new(format!("c{i}.json")))
                .default_state(resources.clone(), "/defaults/Shared.json");
            env.store.load_state_if_storable(instance.clone(), spec).unwrap();
        }
        for instance in &instances {
            assert_eq!(instance.state().level, 7);
        }
        assert_eq!(resources.reads(), 1);
    }

    #[test]
    fn test_default_state_paths_expanded() {
        let env = TestEnv::new();
        let resources = Arc::new(BundledResources::new("plugin").with(
            "/defaults/app/Paths.json",
            r#"{"enabled": true, "level": 0, "dir": "$APP_CONFIG$/cache"}"#,
        ));
        let paths = Settings::new();
        let spec = StateSpec::new("Paths")
            .storage(StorageSpec::new("paths.json"))
            .default_state(resources, "/defaults/app/Paths.json");
        env.store.load_state_if_storable(paths.clone(), spec).unwrap();
        assert_eq!(paths.state().dir, format!("{APP_ROOT}/cache"));
    }

    #[test]
    fn test_malformed_default_propagates() {
        let env = TestEnv::new();
        let resources = Arc::new(BundledResources::new("plugin").with("/bad.json", "{oops"));
        let spec = StateSpec::new("Bad")
            .storage(StorageSpec::new("bad.json"))
            .default_state(resources, "/bad.json");
        let err = env
            .store
            .load_state_if_storable(Settings::new(), spec)
            .unwrap_err();
        assert!(matches!(err, StoreError::MalformedDefaultState { .. }));
        assert!(!env.store.is_registered("Bad"));
    }

    #[test]
    fn test_corrupted_storage_propagates() {
        let env = TestEnv::new();
        env.surface.insert(&env.path("foo.json"), "not json at all");
        let err = env
            .store
            .load_state_if_storable(Settings::new(), foo_spec())
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptedStorage { .. }));
    }

    #[test]
    fn test_state_type_mismatch_is_logged_not_fatal() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!("not a settings object"));

        let foo = Settings::new();
        let record = env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();
        assert!(record.is_some());
        assert_eq!(foo.load_count(), 0);
    }

    #[test]
    fn test_no_storages_is_fatal_plugin_fault() {
        let env = TestEnv::new();
        let spec = StateSpec::new("Orphan").plugin("org.example.orphan");
        let err = env
            .store
            .load_state_if_storable(Settings::new(), spec)
            .unwrap_err();
        assert!(matches!(err, StoreError::NoStorages { .. }));
        assert_eq!(env.listener.plugin_faults(), vec!["org.example.orphan".to_string()]);
    }

    #[test]
    fn test_sandbox_suppresses_plugin_fault() {
        let env = TestEnv::with_sandbox(true);
        let spec = StateSpec::new("Orphan").plugin("org.example.orphan");
        assert!(env.store.load_state_if_storable(Settings::new(), spec).is_err());
        assert!(env.listener.plugin_faults().is_empty());
    }

    #[test]
    fn test_name_conflict_keeps_existing_instance() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 3}));

        let first = Settings::new();
        let record = env.store.load_state_if_storable(first.clone(), foo_spec()).unwrap();
        assert!(record.is_some());

        // Same instance again: the existing record comes back
        let again = env.store.load_state_if_storable(first.clone(), foo_spec()).unwrap();
        assert_eq!(again.unwrap().name(), "Foo");

        // Different instance under the same name: rejected, not loaded
        let second = Settings::new();
        let conflict = env.store.load_state_if_storable(second.clone(), foo_spec()).unwrap();
        assert!(conflict.is_none());
        assert_eq!(second.load_count(), 0);
        assert_eq!(env.store.component_names(), vec!["Foo".to_string()]);
    }

    #[test]
    fn test_watermark_recorded_after_load() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 3}));
        let foo = Settings::new();
        env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();
        // load_state bumps the counter; the watermark reflects it
        assert_eq!(env.store.watermark("Foo"), Some(foo.modification_count()));
    }

    #[test]
    fn test_reload_reinitializes_only_affected_components() {
        let env = TestEnv::new();
        let shared = StorageSpec::new("shared.json");
        for name in ["X", "Y", "Z"] {
            env.put("shared.json", name, json!({"enabled": true, "level": 1}));
        }
        let x = Settings::new();
        let y = Settings::new();
        let z = Settings::new();
        for (name, instance) in [("X", &x), ("Y", &y), ("Z", &z)] {
            env.store
                .load_state_if_storable(instance.clone(), StateSpec::new(name).storage(shared.clone()))
                .unwrap();
        }

        // External edit touches X and Y only
        let mut doc = env.document("shared.json");
        doc["components"]["X"]["level"] = json!(10);
        doc["components"]["Y"]["level"] = json!(20);
        env.surface.insert(&env.path("shared.json"), serde_json::to_vec(&doc).unwrap());

        let storage = env.store.storage_manager().get_state_storage(&shared).unwrap();
        assert!(env.store.reload(&[storage]).unwrap());

        assert_eq!(x.state().level, 10);
        assert_eq!(y.state().level, 20);
        assert_eq!(z.state().level, 1);
        assert_eq!(z.load_count(), 1);
        assert_eq!(env.listener.batches(), (1, 1));
    }

    #[test]
    fn test_reload_without_changes_fires_nothing() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 1}));
        env.store.load_state_if_storable(Settings::new(), foo_spec()).unwrap();

        let storage = env
            .store
            .storage_manager()
            .get_state_storage(&StorageSpec::new("foo.json"))
            .unwrap();
        assert!(!env.store.reload(&[storage]).unwrap());
        assert_eq!(env.listener.batches(), (0, 0));
    }

    #[test]
    fn test_reload_skips_failing_storage() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 1}));
        let foo = Settings::new();
        env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();

        let broken: Arc<dyn StateStorage> = Arc::new(FailingStorage);
        let mut doc = env.document("foo.json");
        doc["components"]["Foo"]["level"] = json!(5);
        env.surface.insert(&env.path("foo.json"), serde_json::to_vec(&doc).unwrap());
        let storage = env
            .store
            .storage_manager()
            .get_state_storage(&StorageSpec::new("foo.json"))
            .unwrap();

        assert!(env.store.reload(&[broken, storage]).unwrap());
        assert_eq!(foo.state().level, 5);
    }

    #[test]
    fn test_define_macro_reinitializes_referencing_components() {
        let env = TestEnv::new();
        env.put(
            "foo.json",
            "Foo",
            json!({"enabled": true, "level": 1, "dir": "$SDK_HOME$/lib"}),
        );
        let foo = Settings::new();
        env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();
        assert_eq!(foo.state().dir, "$SDK_HOME$/lib");
        assert!(env.store.unknown_macros(Some("Foo")).contains("SDK_HOME"));

        let affected = env.store.define_macro("SDK_HOME", "/opt/sdk").unwrap();
        assert_eq!(affected, BTreeSet::from(["Foo".to_string()]));
        assert_eq!(foo.state().dir, "/opt/sdk/lib");
        assert!(env.store.unknown_macros(None).is_empty());
    }

    #[test]
    fn test_reinit_components_reload_data() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 1}));
        let foo = Settings::new();
        env.store.load_state_if_storable(foo.clone(), foo_spec()).unwrap();

        let mut doc = env.document("foo.json");
        doc["components"]["Foo"]["level"] = json!(42);
        env.surface.insert(&env.path("foo.json"), serde_json::to_vec(&doc).unwrap());
        let names = BTreeSet::from(["Foo".to_string()]);

        // Cached storage content is reused without reload_data
        env.store.reinit_components(&names, false).unwrap();
        assert_eq!(foo.state().level, 1);
        assert_eq!(foo.load_count(), 2);

        env.store.reinit_components(&names, true).unwrap();
        assert_eq!(foo.state().level, 42);
        assert_eq!(env.listener.batches(), (2, 2));
    }

    /// Blocks inside `load_state` until released
    struct Gated {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
        loads: AtomicUsize,
    }

    impl PersistentStateComponent for Gated {
        type State = SettingsState;

        fn get_state(&self) -> Option<SettingsState> {
            None
        }

        fn load_state(&self, _state: SettingsState) {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
            }
            let _ = self.release.lock().recv();
        }
    }

    #[test]
    fn test_conflicting_instance_not_loaded_while_name_is_loading() {
        let env = TestEnv::new();
        env.put("foo.json", "Foo", json!({"enabled": true, "level": 3}));

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let gated = Arc::new(Gated {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
            loads: AtomicUsize::new(0),
        });

        let store = env.store.clone();
        let first = gated.clone();
        let loader = thread::spawn(move || store.load_state_if_storable(first, foo_spec()));
        entered_rx.recv().unwrap();

        // The name is claimed while the first instance is still loading
        let second = Settings::new();
        let conflict = env.store.load_state_if_storable(second.clone(), foo_spec()).unwrap();
        assert!(conflict.is_none());
        assert_eq!(second.load_count(), 0);

        release_tx.send(()).unwrap();
        let record = loader.join().unwrap().unwrap();
        assert!(record.is_some());
        assert_eq!(gated.loads.load(Ordering::SeqCst), 1);
        assert_eq!(env.store.component_names(), vec!["Foo".to_string()]);
    }

    #[test]
    fn test_dispose_forgets_components() {
        let env = TestEnv::new();
        env.store.load_state_if_storable(Settings::new(), foo_spec()).unwrap();
        env.store.dispose();
        assert!(env.store.component_names().is_empty());
        assert_eq!(env.store.watermark("Foo"), None);
    }
}
