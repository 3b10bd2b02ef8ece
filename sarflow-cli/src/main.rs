//! sarflow CLI - Command-line interface
//!
//! This binary provides a command-line interface to the sarflow library.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::config::ConfigCommands;
use commands::run::RunArgs;

#[derive(Parser)]
#[command(name = "sarflow")]
#[command(version = sarflow::VERSION)]
#[command(about = "Register terrain-corrected SAR scenes and process only what is missing", long_about = None)]
struct Cli {
    /// Configuration file (default: $SARFLOW_CONFIG, then ~/.sarflow/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a batch of work requests
    Run {
        /// JSON-lines file with one request per line
        requests: PathBuf,

        /// Units processed at the same time (overrides config)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Show which requests would reuse a registered scene, without processing
        #[arg(long)]
        dry_run: bool,
    },

    /// Check registered outputs and look for unregistered results
    Validate,

    /// Reconstruct the registry from result sidecars
    Rebuild {
        /// Directory to scan (default: <output_dir>/rtc)
        #[arg(long)]
        scan_root: Option<PathBuf>,
    },

    /// List registered scenes
    List,

    /// Create a default configuration file
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            requests,
            max_concurrent,
            dry_run,
        } => commands::run::run(RunArgs {
            config: cli.config,
            requests,
            max_concurrent,
            dry_run,
        }),
        Commands::Validate => commands::registry::run_validate(cli.config),
        Commands::Rebuild { scan_root } => commands::registry::run_rebuild(cli.config, scan_root),
        Commands::List => commands::registry::run_list(cli.config),
        Commands::Init { force } => commands::config::run_init(cli.config, force),
        Commands::Config { command } => commands::config::run(command, cli.config),
    };

    if let Err(e) = result {
        e.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["sarflow", "validate", "--config", "/tmp/c.ini"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.ini")));
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "sarflow",
            "run",
            "requests.jsonl",
            "--max-concurrent",
            "4",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                requests,
                max_concurrent,
                dry_run,
            } => {
                assert_eq!(requests, PathBuf::from("requests.jsonl"));
                assert_eq!(max_concurrent, Some(4));
                assert!(dry_run);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_run_requires_requests_file() {
        assert!(Cli::try_parse_from(["sarflow", "run"]).is_err());
    }
}
