//! Component state persistence
//!
//! Long-lived components declare a name and a set of storage files; the
//! store loads their state at registration (falling back to bundled
//! defaults), saves every component in one pass, and reinitializes only the
//! components whose files changed externally. Machine-specific paths inside
//! stored state are kept portable through `$MACRO$` substitution.

#![forbid(unsafe_code)]

pub mod component;
pub mod config;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod path_macros;
pub mod storage;
pub mod store;

pub use component::{
    Capabilities, DefaultStateResource, PersistentStateComponent, SettingsSavingComponent,
    StateSpec, StorageSpec, UiStateBridge,
};
pub use config::{StoreConfig, StoreScope};
pub use defaults::{BundledResources, DefaultStateCache, DirResources, ResourceProvider};
pub use error::{PluginId, Result, StoreError};
pub use path_macros::{MacroTable, PathMacroSubstitutor};
pub use storage::{
    FileSurface, LocalFileSurface, MemoryFileSurface, ReadOnlyTarget, RoamingType, SaveSession,
    StateStorage, StateStorageManager, StorageExternalization, StorageFactory, StreamProvider,
};
pub use store::{
    ChannelUiExecutor, ComponentStore, InlineUiExecutor, NoopListener, RegisteredComponent,
    SaveToken, StoreListener, UiExecutor, UiTaskReceiver,
};
