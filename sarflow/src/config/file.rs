//! Locating, loading and saving `config.ini`.
//!
//! The file is looked up at `$SARFLOW_CONFIG` first, then at
//! `~/.sarflow/config.ini`. Relative paths inside a loaded file are taken
//! relative to the file's own directory, so a project can keep its
//! configuration next to its output tree.
//!
//! Loading rejects settings that contradict each other. Settings that load
//! but cannot run a batch as written are reported by [`ConfigFile::warnings`].

use ini::Ini;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use super::settings::*;

/// Environment variable naming the configuration file to use.
pub const CONFIG_ENV: &str = "SARFLOW_CONFIG";

pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("Failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single value that does not parse or is out of range
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// Two values that are valid alone but not together
    #[error("Conflicting configuration: {first} and {second} - {reason}")]
    Conflict {
        first: String,
        second: String,
        reason: String,
    },
}

/// A setting that loads but will not behave as a batch run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// No program configured for a collaborator section
    MissingCommand { section: &'static str },
    /// A command given as a path that does not exist
    CommandNotFound { section: &'static str, path: PathBuf },
    /// Fewer GPUs than processing slots, so slots share devices
    SharedGpus { gpus: usize, slots: usize },
    /// Marker completion with no processing timeout waits forever on a lost job
    MarkerWithoutTimeout,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCommand { section } => {
                write!(f, "[{section}] command is not set; batches cannot run")
            }
            Self::CommandNotFound { section, path } => {
                write!(f, "[{section}] command {} does not exist", path.display())
            }
            Self::SharedGpus { gpus, slots } => write!(
                f,
                "{gpus} GPU(s) configured for {slots} processing slots; slots will share devices"
            ),
            Self::MarkerWithoutTimeout => write!(
                f,
                "marker completion without [processing] timeout_secs waits forever for a lost job"
            ),
        }
    }
}

impl ConfigFile {
    /// Load configuration from [`config_file_path`].
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load() -> Result<Self, ConfigFileError> {
        let path = config_file_path();
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    ///
    /// If the file doesn't exist, returns defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = super::parser::parse_ini(&ini)?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.anchor_relative_paths(base);
        }
        config.check_consistency()?;
        Ok(config)
    }

    /// Save configuration to [`config_file_path`].
    pub fn save(&self) -> Result<(), ConfigFileError> {
        let path = config_file_path();
        self.save_to(&path)
    }

    /// Save configuration to a specific path, creating its directory.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        let write_error = |source| ConfigFileError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }

        let content = super::writer::to_config_string(self);
        crate::fsutil::write_atomic(path, content.as_bytes()).map_err(write_error)
    }

    /// Render the configuration as the commented INI text `save_to` writes.
    pub fn to_ini_string(&self) -> String {
        super::writer::to_config_string(self)
    }

    /// Create the config file at `path` with defaults if it doesn't exist.
    ///
    /// Returns true if a file was created.
    pub fn ensure_exists(path: &Path) -> Result<bool, ConfigFileError> {
        if path.exists() {
            return Ok(false);
        }
        Self::default().save_to(path)?;
        Ok(true)
    }

    /// Settings that will not run a batch as written.
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let commands = [
            ("acquisition", self.acquisition.command.as_deref()),
            ("processing", self.processing.command.as_deref()),
        ];
        for (section, command) in commands {
            match command {
                None => warnings.push(ConfigWarning::MissingCommand { section }),
                Some(path) if is_path_like(path) && !path.exists() => {
                    warnings.push(ConfigWarning::CommandNotFound {
                        section,
                        path: path.to_path_buf(),
                    })
                }
                Some(_) => {}
            }
        }

        let gpus = self.processing.gpu_ids.len();
        let slots = self.pipeline.max_concurrent_jobs;
        if gpus > 0 && gpus < slots {
            warnings.push(ConfigWarning::SharedGpus { gpus, slots });
        }

        if self.processing.completion == CompletionMode::Marker && self.processing.timeout_secs == 0 {
            warnings.push(ConfigWarning::MarkerWithoutTimeout);
        }

        warnings
    }

    fn anchor_relative_paths(&mut self, base: &Path) {
        anchor(&mut self.paths.output_dir, base);
        if let Some(registry) = self.paths.registry_file.as_mut() {
            anchor(registry, base);
        }
        anchor(&mut self.logging.file, base);

        // Bare program names are looked up on PATH instead.
        for command in [
            self.acquisition.command.as_mut(),
            self.processing.command.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if is_path_like(command) {
                anchor(command, base);
            }
        }
    }

    fn check_consistency(&self) -> Result<(), ConfigFileError> {
        if self.registry.initial_backoff_ms > self.registry.max_backoff_ms {
            return Err(ConfigFileError::Conflict {
                first: "registry.initial_backoff_ms".into(),
                second: "registry.max_backoff_ms".into(),
                reason: format!(
                    "initial backoff {}ms exceeds the maximum {}ms",
                    self.registry.initial_backoff_ms, self.registry.max_backoff_ms
                ),
            });
        }
        if self.processing.poll_initial_secs > self.processing.poll_max_secs {
            return Err(ConfigFileError::Conflict {
                first: "processing.poll_initial_secs".into(),
                second: "processing.poll_max_secs".into(),
                reason: format!(
                    "initial poll interval {}s exceeds the maximum {}s",
                    self.processing.poll_initial_secs, self.processing.poll_max_secs
                ),
            });
        }
        Ok(())
    }
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn is_path_like(path: &Path) -> bool {
    path.components().count() > 1
}

/// Get the path to the config directory (~/.sarflow).
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sarflow")
}

/// The configuration file in effect: `$SARFLOW_CONFIG` when set, otherwise
/// `~/.sarflow/config.ini`.
pub fn config_file_path() -> PathBuf {
    config_file_path_from(std::env::var_os(CONFIG_ENV))
}

fn config_file_path_from(env: Option<OsString>) -> PathBuf {
    match env.filter(|value| !value.is_empty()) {
        Some(value) => PathBuf::from(value),
        None => config_directory().join(CONFIG_FILE_NAME),
    }
}
