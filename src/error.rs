//! Error types for component state persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Identifier of the plugin that contributed a component, if known.
pub type PluginId = String;

/// Errors raised by the persistence engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A stateful component declared no storages. Fatal at registration.
    #[error("component '{component}' declares no storages{}", plugin_suffix(.plugin))]
    NoStorages {
        component: String,
        plugin: Option<PluginId>,
    },

    /// A save targeted a file that cannot be written.
    #[error("cannot save read-only file {file}")]
    ReadOnlyModification { file: String },

    /// A bundled default-state resource could not be parsed.
    #[error("malformed default state resource {path}: {source}")]
    MalformedDefaultState {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing a storage file failed.
    #[error("I/O error on {path}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    /// A storage file exists but its content is not a valid state document.
    #[error("corrupted storage {file}: {source}")]
    CorruptedStorage {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    /// A component state could not be converted to or from its tree form.
    #[error("cannot convert state of component '{component}': {source}")]
    StateConversion {
        component: String,
        #[source]
        source: serde_json::Error,
    },

    /// A component failed while producing its state.
    #[error("cannot get state of component '{component}'{}: {message}", plugin_suffix(.plugin))]
    ComponentState {
        component: String,
        plugin: Option<PluginId>,
        message: String,
    },

    /// A storage spec resolved to nothing a backend can serve.
    #[error("storage spec '{0}' cannot be mapped to a storage")]
    UnresolvableStorage(String),

    /// `add_macro` was called for a name that is already defined.
    #[error("macro ${0}$ is already defined")]
    MacroAlreadyDefined(String),

    /// A save was started while a save with the same token was in progress.
    #[error("re-entrant save attempted from inside an active save session")]
    ReentrantSave,

    /// The async save pipeline was cancelled before it completed.
    #[error("save cancelled")]
    SaveCancelled,

    /// One or more failures during a single save pass.
    #[error("save failed with {} error(s): {}", .0.len(), join_messages(.0))]
    SaveFailed(Vec<StoreError>),
}

impl StoreError {
    /// Cancellation is informational, not a failure worth reporting.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StoreError::SaveCancelled)
    }

    /// Errors that must reach the caller of a load instead of being logged.
    pub(crate) fn propagates_from_load(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. }
                | StoreError::CorruptedStorage { .. }
                | StoreError::ReadOnlyModification { .. }
                | StoreError::MalformedDefaultState { .. }
        )
    }

    /// Plugin responsible for this failure, if any.
    pub fn plugin(&self) -> Option<&str> {
        match self {
            StoreError::NoStorages { plugin, .. } | StoreError::ComponentState { plugin, .. } => {
                plugin.as_deref()
            }
            StoreError::SaveFailed(errors) => errors.iter().find_map(|e| e.plugin()),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            error,
        }
    }
}

fn plugin_suffix(plugin: &Option<PluginId>) -> String {
    match plugin {
        Some(id) => format!(" (plugin {id})"),
        None => String::new(),
    }
}

fn join_messages(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, StoreError>;
