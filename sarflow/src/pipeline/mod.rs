//! Work unit pipeline.
//!
//! Each [`WorkRequest`] becomes a [`WorkUnit`] that moves through
//!
//! ```text
//! Pending → Acquiring → Processing → Validating → Registered
//!    └──> Skipped                 (any active state) → Failed
//! ```
//!
//! # Key Components
//!
//! - [`WorkRequest`] - what to produce: reference footprint, time and
//!   polarization, plus matching tolerances
//! - [`WorkUnit`] / [`UnitReport`] - transient progress tracking and its
//!   final account
//! - [`Orchestrator`] - drives one unit against the registry and the
//!   collaborators
//! - [`BatchRunner`] - runs many units under the scheduler
//! - [`ProcessingJournal`] - append-only JSON lines of every transition
//!
//! # Example
//!
//! ```ignore
//! use sarflow::pipeline::{BatchOptions, BatchRunner, Orchestrator, OutputLayout};
//!
//! let layout = OutputLayout::new("/data/output");
//! let store = RegistryStore::new(layout.registry_path());
//! let orchestrator = Orchestrator::new(layout, store, acquirer, processor);
//! let runner = BatchRunner::new(Arc::new(orchestrator), BatchOptions::default());
//!
//! let summary = runner.run(requests, CancellationToken::new()).await?;
//! println!("{}", summary);
//! ```

mod batch;
mod journal;
mod orchestrator;
mod request;
mod state;
mod unit;
mod validate;

pub use batch::{BatchOptions, BatchRunner, BatchSummary, FailedUnit, DEFAULT_REQUEUE_LIMIT};
pub use journal::{JournalEntry, ProcessingJournal, JOURNAL_FILE};
pub use orchestrator::{
    registry_failure, Orchestrator, OutputLayout, LOGS_DIR, RESULTS_DIR, SCRATCH_DIR,
};
pub use request::{
    classify_phase, footprint_from_pairs, parse_requests, timestamp_from_name, RequestDefaults,
    RequestError, RequestSpec, WorkRequest, WorkRequestBuilder, DEFAULT_POLARIZATION,
    DEFAULT_SEARCH_WINDOW_DAYS, DEFAULT_TOLERANCE_DEGREES,
};
pub use state::{FailureKind, FailureReason, UnitState};
pub use unit::{Transition, UnitId, UnitReport, WorkUnit};
pub use validate::{validate_inputs, validate_outputs, MIN_SCENE_ARCHIVE_BYTES};

use crate::registry::RegistryError;
use std::io;
use thiserror::Error;

/// Pipeline errors that end a run rather than a single unit.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A unit was driven through a transition the state machine forbids.
    #[error("Illegal transition for unit {unit}: {from} -> {to}")]
    IllegalTransition {
        unit: UnitId,
        from: &'static str,
        to: &'static str,
    },

    /// The registry document is unreadable; the run halted.
    #[error("Registry is corrupt, run halted: {0}")]
    CorruptRegistry(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Pipeline I/O error: {0}")]
    Io(#[from] io::Error),
}
