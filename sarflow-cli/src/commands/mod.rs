//! CLI command implementations.
//!
//! Each subcommand has its own module with argument definitions and handlers.
//!
//! # Command Modules
//!
//! - [`config`] - Configuration management (init, show, path)
//! - [`registry`] - Registry maintenance (validate, rebuild, list)
//! - [`run`] - Main command (process a batch of requests)

pub mod config;
pub mod registry;
pub mod run;
