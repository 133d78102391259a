//! Crate-wide constants
//!
//! Macro names, file-format keys and default values used across the store,
//! kept in one place so storages and the router agree on them.

/// Well-known path macros
pub mod macros {
    /// Root of application-level configuration
    pub const APP_CONFIG: &str = "APP_CONFIG";

    /// Root of project-level configuration
    pub const PROJECT_CONFIG_DIR: &str = "PROJECT_CONFIG_DIR";

    /// Directory of a module
    pub const MODULE_DIR: &str = "MODULE_DIR";

    /// User home directory
    pub const USER_HOME: &str = "USER_HOME";

    /// Delimiter around macro names (`$NAME$`)
    pub const DELIMITER: char = '$';
}

/// Storage document layout
pub mod storage {
    /// Top-level key holding per-component state trees
    pub const COMPONENTS_KEY: &str = "components";

    /// Top-level key holding the document format version
    pub const VERSION_KEY: &str = "version";

    /// Current storage document version
    pub const FORMAT_VERSION: u64 = 1;
}

/// Configuration file defaults
pub mod config {
    /// Application directory under the platform config dir
    pub const APP_DIR: &str = "component-store";

    /// Environment variable selecting the log level
    pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
}
