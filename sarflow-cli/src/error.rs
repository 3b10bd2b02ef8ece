//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::path::PathBuf;
use std::process;
use sarflow::config::ConfigFileError;
use sarflow::pipeline::{PipelineError, RequestError};
use sarflow::registry::RegistryError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Configuration error
    Config(String),
    /// A collaborator program is not configured
    MissingCollaborator(&'static str),
    /// Failed to read the requests document
    RequestsRead { path: PathBuf, error: std::io::Error },
    /// Requests document is invalid
    Requests(RequestError),
    /// Registry operation failed
    Registry(RegistryError),
    /// Batch stopped before finishing
    Pipeline(PipelineError),
    /// Batch finished with failed units or registry findings
    Unclean { failed: usize, issues: usize },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        // Print additional help for specific errors
        match self {
            CliError::MissingCollaborator(section) => {
                eprintln!();
                eprintln!("Set the program to run in the [{}] section:", section);
                eprintln!("  sarflow config path   (shows which file to edit)");
                eprintln!("  [{}]", section);
                eprintln!("  command = /path/to/program");
            }
            CliError::Pipeline(PipelineError::CorruptRegistry(_))
            | CliError::Registry(RegistryError::Corrupt { .. }) => {
                eprintln!();
                eprintln!("The registry document could not be read. To recover:");
                eprintln!("  1. Rebuild it from result sidecars: sarflow rebuild");
                eprintln!("  2. Or set rebuild_on_corrupt = true in [registry]");
                eprintln!("A backup of the damaged document is kept next to it.");
            }
            CliError::Registry(RegistryError::Contention { .. }) => {
                eprintln!();
                eprintln!("Another process kept the registry locked. If no other run is");
                eprintln!("active, the lock is recovered after [registry] lock_stale_secs.");
            }
            CliError::Unclean { .. } => {
                eprintln!("See the log file for details of each failed unit.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::MissingCollaborator(section) => {
                write!(f, "No {} command configured", section)
            }
            CliError::RequestsRead { path, error } => {
                write!(f, "Failed to read requests '{}': {}", path.display(), error)
            }
            CliError::Requests(e) => write!(f, "Invalid requests: {}", e),
            CliError::Registry(e) => write!(f, "Registry error: {}", e),
            CliError::Pipeline(e) => write!(f, "Batch aborted: {}", e),
            CliError::Unclean { failed, issues } => write!(
                f,
                "Batch finished with {} failed unit(s) and {} registry issue(s)",
                failed, issues
            ),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::RequestsRead { error, .. } => Some(error),
            CliError::Requests(e) => Some(e),
            CliError::Registry(e) => Some(e),
            CliError::Pipeline(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<RegistryError> for CliError {
    fn from(e: RegistryError) -> Self {
        CliError::Registry(e)
    }
}

impl From<PipelineError> for CliError {
    fn from(e: PipelineError) -> Self {
        CliError::Pipeline(e)
    }
}

impl From<RequestError> for CliError {
    fn from(e: RequestError) -> Self {
        CliError::Requests(e)
    }
}
