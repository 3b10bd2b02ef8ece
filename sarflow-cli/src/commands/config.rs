//! Configuration management CLI commands.
//!
//! Provides `config show` and `config path` for inspecting the settings in
//! effect, and the `init` command that writes a default configuration file.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use sarflow::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration (defaults fill missing values)
    Show,

    /// Show the configuration file path
    Path,
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands, config: Option<PathBuf>) -> Result<(), CliError> {
    let path = resolve_path(config);
    match command {
        ConfigCommands::Show => run_show(&path),
        ConfigCommands::Path => run_path(&path),
    }
}

/// Write a default configuration file.
pub fn run_init(config: Option<PathBuf>, force: bool) -> Result<(), CliError> {
    let path = resolve_path(config);

    if force {
        ConfigFile::default().save_to(&path)?;
        println!("✓ Wrote default configuration to {}", path.display());
    } else if ConfigFile::ensure_exists(&path)? {
        println!("✓ Created {}", path.display());
    } else {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to overwrite it with defaults.");
        return Ok(());
    }

    println!();
    println!("Next, set the collaborator programs:");
    println!("  [acquisition] command = ...");
    println!("  [processing]  command = ...");
    Ok(())
}

fn resolve_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(config_file_path)
}

fn run_show(path: &Path) -> Result<(), CliError> {
    let config = ConfigFile::load_from(path)?;
    if !path.exists() {
        println!("; {} does not exist, showing defaults", path.display());
    }
    for warning in config.warnings() {
        println!("; warning: {}", warning);
    }
    print!("{}", config.to_ini_string());
    Ok(())
}

fn run_path(path: &Path) -> Result<(), CliError> {
    println!("{}", path.display());
    if !path.exists() {
        println!("(file does not exist, run 'sarflow init' to create it)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_then_keeps_existing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");

        run_init(Some(path.clone()), false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[pipeline]"));

        std::fs::write(&path, "[pipeline]\nmax_concurrent_jobs = 3\n").unwrap();
        run_init(Some(path.clone()), false).unwrap();
        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.pipeline.max_concurrent_jobs, 3);
    }

    #[test]
    fn test_init_force_resets_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[pipeline]\nmax_concurrent_jobs = 3\n").unwrap();

        run_init(Some(path.clone()), true).unwrap();
        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(
            config.pipeline.max_concurrent_jobs,
            ConfigFile::default().pipeline.max_concurrent_jobs
        );
    }
}
