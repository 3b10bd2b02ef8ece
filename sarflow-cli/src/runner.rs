//! CLI runner for common setup and operations.
//!
//! Encapsulates config loading, logging initialization and construction of
//! the registry and orchestrator to reduce duplication across command
//! handlers.

use crate::error::CliError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use sarflow::config::{config_file_path, ConfigFile};
use sarflow::logging::{init_logging, LoggingGuard};
use sarflow::pipeline::{Orchestrator, OutputLayout, ProcessingJournal};
use sarflow::registry::RegistryStore;
use sarflow::resolver::OverlapResolver;

/// Runner that manages CLI lifecycle and common operations.
pub struct CliRunner {
    /// Logging guard - keeps logging active while runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    /// Loaded configuration file
    config: ConfigFile,
    config_path: PathBuf,
}

impl CliRunner {
    /// Create a new CLI runner, loading config and initializing logging.
    ///
    /// Log events are echoed to stdout only when stdout is not a terminal,
    /// so interactive runs see the progress lines and summary alone.
    pub fn new(config_path: Option<&Path>) -> Result<Self, CliError> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(config_file_path);
        let config = ConfigFile::load_from(&config_path)?;

        let stdout_enabled = !atty::is(atty::Stream::Stdout);
        let logging_guard = init_logging(&config.logging.file, &config.logging.level, stdout_enabled)
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        for warning in config.warnings() {
            warn!(config = %config_path.display(), "{}", warning);
        }

        Ok(Self {
            logging_guard,
            config,
            config_path,
        })
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Path the configuration was loaded from (it may not exist).
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Log startup information for a command.
    pub fn log_startup(&self, command: &str) {
        info!("sarflow v{}", sarflow::VERSION);
        info!(config = %self.config_path.display(), "sarflow CLI: {} command", command);
    }

    /// Output directory layout from the configuration.
    pub fn layout(&self) -> OutputLayout {
        OutputLayout::new(&self.config.paths.output_dir)
    }

    /// Registry store with the configured commit policy.
    pub fn store(&self) -> RegistryStore {
        RegistryStore::new(self.config.paths.registry_path())
            .with_policy(self.config.registry.commit_policy())
    }

    /// Build an orchestrator wired to the configured collaborator programs.
    ///
    /// A journal that cannot be opened is logged and skipped; runs still
    /// proceed without it.
    pub fn create_orchestrator(&self) -> Result<Orchestrator, CliError> {
        let acquirer = self
            .config
            .acquisition
            .acquirer()
            .ok_or(CliError::MissingCollaborator("acquisition"))?;
        let processor = self
            .config
            .processing
            .processor()
            .ok_or(CliError::MissingCollaborator("processing"))?;

        let layout = self.layout();
        let journal = match ProcessingJournal::open(layout.journal_path()) {
            Ok(journal) => journal,
            Err(e) => {
                warn!(path = %layout.journal_path().display(), error = %e, "Processing journal disabled");
                ProcessingJournal::disabled()
            }
        };

        let orchestrator = Orchestrator::new(layout, self.store(), Arc::new(acquirer), Arc::new(processor))
            .with_resolver(OverlapResolver::new(self.config.search.reuse_policy))
            .with_journal(Arc::new(journal));

        info!(
            output_dir = %self.config.paths.output_dir.display(),
            registry = %self.config.paths.registry_path().display(),
            "Orchestrator created"
        );
        Ok(orchestrator)
    }
}
