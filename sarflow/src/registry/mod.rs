//! Scene registry: the durable catalog of processed SAR scenes.
//!
//! The registry is a single JSON document replaced atomically on every
//! commit. Concurrent writers, in this process or others, coordinate through
//! an optimistic generation check and a short-lived lock sentinel; see
//! [`RegistryStore::commit`].
//!
//! # Example
//!
//! ```ignore
//! use sarflow::registry::RegistryStore;
//!
//! let store = RegistryStore::new("/data/output/sar_registry.json");
//! let registry = store
//!     .commit(move |registry| {
//!         registry.upsert(record.clone());
//!         Ok(())
//!     })
//!     .await?;
//! ```

mod lock;
mod store;
mod types;

pub use lock::{CommitLock, LockSentinel, UNKNOWN_HOST};
pub use store::{
    write_sidecar, CommitPolicy, PublishOutcome, RebuildReport, RegistryStore, StagedCommit,
    DEFAULT_COMMIT_ATTEMPTS, DEFAULT_INITIAL_BACKOFF, DEFAULT_LOCK_STALE_AFTER,
    DEFAULT_MAX_BACKOFF, REGISTRY_FILE, SIDECAR_FILE,
};
pub use types::{
    EventPhase, Polarization, Registry, RegistryIssue, SceneId, SceneRecord, SceneStatus,
    REGISTRY_VERSION,
};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The persisted document cannot be trusted. Fatal for a run.
    #[error("Registry at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Commit retries were exhausted. Retryable at the unit level.
    #[error("Registry commit abandoned after {attempts} contended attempts")]
    Contention { attempts: u32 },

    /// The mutation refused to apply.
    #[error("Registry commit rejected: {0}")]
    Rejected(String),

    #[error("Registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A blocking registry task panicked or was cancelled.
    #[error("Registry task failed: {0}")]
    Task(String),
}

impl RegistryError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests;
