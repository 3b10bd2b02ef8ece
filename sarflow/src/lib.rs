//! sarflow - SAR scene registry and overlap-aware processing orchestrator
//!
//! This library keeps a durable catalog of terrain-corrected SAR products and
//! drives new ones through acquisition and processing only when no
//! registered scene already covers a request.
//!
//! # High-Level API
//!
//! ```ignore
//! use sarflow::config::ConfigFile;
//! use sarflow::pipeline::{BatchRunner, Orchestrator, OutputLayout};
//! use sarflow::registry::RegistryStore;
//!
//! let config = ConfigFile::load()?;
//! let layout = OutputLayout::new(&config.paths.output_dir);
//! let store = RegistryStore::new(config.paths.registry_path())
//!     .with_policy(config.registry.commit_policy());
//! let orchestrator = Orchestrator::new(layout, store, acquirer, processor);
//!
//! let runner = BatchRunner::new(Arc::new(orchestrator), config.batch_options());
//! let summary = runner.run(requests, CancellationToken::new()).await?;
//! ```
//!
//! # Modules
//!
//! - [`geo`] - footprints, overlap and temporal matching
//! - [`registry`] - crash-safe registry document with optimistic commits
//! - [`resolver`] - reuse decisions over a registry snapshot
//! - [`pipeline`] - work unit state machine, orchestrator and batch driver
//! - [`scheduler`] - admission control and unit tasks
//! - [`collaborator`] - acquisition and processing contracts

pub mod collaborator;
pub mod config;
pub mod fsutil;
pub mod geo;
pub mod logging;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod scheduler;

/// Version of the sarflow library and CLI.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
