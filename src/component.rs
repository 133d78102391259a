//! Stateful component contract and state declarations
//!
//! A component exposes its state as a serde type. The store only ever sees
//! the serialized tree form ([`serde_json::Value`]); conversion happens in
//! the adapters at the bottom of this module, whose capability flags are
//! fixed at registration time.

use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::error;

use crate::defaults::ResourceProvider;
use crate::error::{PluginId, Result, StoreError};
use crate::storage::RoamingType;

/// A unit of durable configuration with a load/save contract.
pub trait PersistentStateComponent: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send + 'static;

    /// Whether [`state_modification_count`](Self::state_modification_count) is meaningful
    const TRACKS_MODIFICATIONS: bool = false;

    /// Current state to persist, `None` to skip this component.
    fn get_state(&self) -> Option<Self::State>;

    fn load_state(&self, state: Self::State);

    /// Monotonically increasing counter bumped on every state mutation.
    fn state_modification_count(&self) -> u64 {
        0
    }
}

/// Components whose state has to be read from interactive widgets.
///
/// The first step runs on the UI-owning context, the second converts the
/// captured widget state into the persisted form.
pub trait UiStateBridge: PersistentStateComponent {
    type UiState: Send + 'static;

    fn get_state_from_ui(&self) -> Self::UiState;

    fn get_state_for_ui(&self, ui_state: Self::UiState) -> Option<Self::State>;
}

/// Components that persist themselves outside the component-state model.
pub trait SettingsSavingComponent: Send + Sync {
    fn name(&self) -> &str;

    fn save(&self, token: &crate::store::SaveToken) -> anyhow::Result<()>;
}

/// One persistence target a component declares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageSpec {
    /// Logical file token, may contain `$MACRO$` references
    pub file: String,
    pub roaming: RoamingType,
    pub deprecated: bool,
}

impl StorageSpec {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            roaming: RoamingType::Default,
            deprecated: false,
        }
    }

    pub fn deprecated(file: impl Into<String>) -> Self {
        Self {
            deprecated: true,
            ..Self::new(file)
        }
    }

    pub fn with_roaming(mut self, roaming: RoamingType) -> Self {
        self.roaming = roaming;
        self
    }
}

/// Authoritative storages first, deprecated last, each group in declaration order.
pub fn sort_storages(specs: &[StorageSpec]) -> Vec<StorageSpec> {
    let mut sorted = specs.to_vec();
    sorted.sort_by_key(|spec| spec.deprecated);
    sorted
}

/// Bundled default state: a resource path inside a resource scope.
#[derive(Clone)]
pub struct DefaultStateResource {
    pub scope: Arc<dyn ResourceProvider>,
    pub path: String,
}

impl std::fmt::Debug for DefaultStateResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultStateResource")
            .field("scope", &self.scope.scope_id())
            .field("path", &self.path)
            .finish()
    }
}

/// Per-type state declaration supplied by the host at registration.
#[derive(Debug, Clone)]
pub struct StateSpec {
    pub name: String,
    pub storages: Vec<StorageSpec>,
    pub default_state: Option<DefaultStateResource>,
    pub plugin: Option<PluginId>,
}

impl StateSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storages: Vec::new(),
            default_state: None,
            plugin: None,
        }
    }

    pub fn storage(mut self, spec: StorageSpec) -> Self {
        self.storages.push(spec);
        self
    }

    pub fn default_state(mut self, scope: Arc<dyn ResourceProvider>, path: impl Into<String>) -> Self {
        self.default_state = Some(DefaultStateResource {
            scope,
            path: path.into(),
        });
        self
    }

    pub fn plugin(mut self, plugin: impl Into<PluginId>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    /// Reject declarations without storages; flag ambiguous authority.
    pub fn validate(&self) -> Result<()> {
        if self.storages.is_empty() {
            return Err(StoreError::NoStorages {
                component: self.name.clone(),
                plugin: self.plugin.clone(),
            });
        }
        let authoritative = self.storages.iter().filter(|s| !s.deprecated).count();
        if self.storages.len() > 1 && authoritative > 1 {
            // First declared wins; keep going
            error!(
                component = %self.name,
                storages = ?self.storages.iter().map(|s| s.file.as_str()).collect::<Vec<_>>(),
                "Component declares more than one non-deprecated storage"
            );
        }
        Ok(())
    }

    /// Storages in load/save priority order
    pub fn sorted_storages(&self) -> Vec<StorageSpec> {
        sort_storages(&self.storages)
    }
}

/// Capabilities detected once at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub modification_tracked: bool,
    pub ui_bridged: bool,
}

/// Type-erased view of a registered component.
pub(crate) trait StoredComponent: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Identity of the live instance
    fn instance_id(&self) -> usize;

    fn modification_count(&self) -> u64;

    fn state_tree(&self, name: &str) -> Result<Option<Value>>;

    fn load_tree(&self, name: &str, tree: Value) -> Result<()>;

    /// First half of the UI bridge; `None` for plain components.
    fn capture_ui_state(&self) -> Option<Box<dyn Any + Send>>;

    /// Second half of the UI bridge.
    fn state_tree_from_ui(&self, name: &str, ui_state: Box<dyn Any + Send>) -> Result<Option<Value>>;
}

fn to_tree<S: Serialize>(name: &str, state: Option<S>) -> Result<Option<Value>> {
    state
        .map(|s| {
            serde_json::to_value(s).map_err(|source| StoreError::StateConversion {
                component: name.to_string(),
                source,
            })
        })
        .transpose()
}

fn load_into<C: PersistentStateComponent>(component: &C, name: &str, tree: Value) -> Result<()> {
    let state = serde_json::from_value::<C::State>(tree).map_err(|source| {
        StoreError::StateConversion {
            component: name.to_string(),
            source,
        }
    })?;
    component.load_state(state);
    Ok(())
}

pub(crate) struct PlainAdapter<C>(pub Arc<C>);

impl<C: PersistentStateComponent> StoredComponent for PlainAdapter<C> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modification_tracked: C::TRACKS_MODIFICATIONS,
            ui_bridged: false,
        }
    }

    fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn modification_count(&self) -> u64 {
        self.0.state_modification_count()
    }

    fn state_tree(&self, name: &str) -> Result<Option<Value>> {
        to_tree(name, self.0.get_state())
    }

    fn load_tree(&self, name: &str, tree: Value) -> Result<()> {
        load_into(self.0.as_ref(), name, tree)
    }

    fn capture_ui_state(&self) -> Option<Box<dyn Any + Send>> {
        None
    }

    fn state_tree_from_ui(&self, name: &str, _ui_state: Box<dyn Any + Send>) -> Result<Option<Value>> {
        self.state_tree(name)
    }
}

pub(crate) struct UiBridgedAdapter<C>(pub Arc<C>);

impl<C: UiStateBridge> StoredComponent for UiBridgedAdapter<C> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            modification_tracked: C::TRACKS_MODIFICATIONS,
            ui_bridged: true,
        }
    }

    fn instance_id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    fn modification_count(&self) -> u64 {
        self.0.state_modification_count()
    }

    fn state_tree(&self, name: &str) -> Result<Option<Value>> {
        let ui_state = self.0.get_state_from_ui();
        to_tree(name, self.0.get_state_for_ui(ui_state))
    }

    fn load_tree(&self, name: &str, tree: Value) -> Result<()> {
        load_into(self.0.as_ref(), name, tree)
    }

    fn capture_ui_state(&self) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(self.0.get_state_from_ui()))
    }

    fn state_tree_from_ui(&self, name: &str, ui_state: Box<dyn Any + Send>) -> Result<Option<Value>> {
        match ui_state.downcast::<C::UiState>() {
            Ok(ui_state) => to_tree(name, self.0.get_state_for_ui(*ui_state)),
            Err(_) => Err(StoreError::ComponentState {
                component: name.to_string(),
                plugin: None,
                message: "captured UI state has an unexpected type".to_string(),
            }),
        }
    }
}
