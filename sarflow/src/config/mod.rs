//! Configuration for sarflow.
//!
//! User settings live in `~/.sarflow/config.ini`, or the file named by
//! `SARFLOW_CONFIG`. Each INI section maps to
//! one settings struct, and each struct builds the runtime types it
//! configures (commit policy, batch options, collaborator adapters).
//!
//! # Example
//!
//! ```ignore
//! use sarflow::config::ConfigFile;
//!
//! let config = ConfigFile::load()?;
//! let store = RegistryStore::new(config.paths.registry_path())
//!     .with_policy(config.registry.commit_policy());
//! let options = config.batch_options();
//! ```

mod defaults;
mod file;
mod parser;
mod settings;
mod writer;

pub use defaults::{
    default_output_dir, DEFAULT_ADMISSION_TIMEOUT_SECS, DEFAULT_LOG_FILE, DEFAULT_LOG_LEVEL,
    DEFAULT_MARKER_FILE, DEFAULT_MAX_ACTIVE_UNITS, DEFAULT_POLL_INITIAL_SECS,
    DEFAULT_POLL_MAX_SECS, MAX_CONCURRENT_JOBS, MIN_CONCURRENT_JOBS,
};
pub use file::{
    config_directory, config_file_path, ConfigFileError, ConfigWarning, CONFIG_ENV,
    CONFIG_FILE_NAME,
};
pub use settings::{
    AcquisitionSettings, CompletionMode, ConfigFile, LoggingSettings, PathsSettings,
    PipelineSettings, ProcessingSettings, RegistrySettings, SearchSettings,
};
