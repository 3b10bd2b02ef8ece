//! Work unit states and failure reasons.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified cause of a failed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AcquisitionError,
    ProcessingError,
    ValidationError,
    /// Registry commit retries exhausted; the unit may be re-queued.
    RegistryContention,
    /// The registry document is unreadable; fatal for the run.
    CorruptRegistry,
    /// Registry I/O failed for a reason other than contention or corruption.
    RegistryUnavailable,
    SchedulingTimeout,
    /// The run shut down before the unit finished.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcquisitionError => "acquisition_error",
            Self::ProcessingError => "processing_error",
            Self::ValidationError => "validation_error",
            Self::RegistryContention => "registry_contention",
            Self::CorruptRegistry => "corrupt_registry",
            Self::RegistryUnavailable => "registry_unavailable",
            Self::SchedulingTimeout => "scheduling_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a unit failed, with a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

/// Lifecycle state of a work unit.
///
/// ```text
/// Pending ─┬─> Acquiring ─> Processing ─> Validating ─┬─> Registered
///          │       │             │             │       └─> Failed
///          │       └─────────────┴─────────────┴─────────> Failed
///          ├─> Skipped
///          └─> Failed
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum UnitState {
    #[default]
    Pending,
    Acquiring,
    Processing,
    Validating,
    Registered,
    Failed(FailureReason),
    Skipped,
}

impl UnitState {
    /// Returns true for Registered, Failed and Skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Registered | Self::Failed(_) | Self::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Short name without the failure detail.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acquiring => "acquiring",
            Self::Processing => "processing",
            Self::Validating => "validating",
            Self::Registered => "registered",
            Self::Failed(_) => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &UnitState) -> bool {
        use UnitState::*;
        match (self, next) {
            (_, Failed(_)) => !self.is_terminal(),
            (Pending, Acquiring) | (Pending, Skipped) => true,
            (Acquiring, Processing) => true,
            (Processing, Validating) => true,
            (Validating, Registered) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({})", reason),
            Self::Pending => write!(f, "Pending"),
            Self::Acquiring => write!(f, "Acquiring"),
            Self::Processing => write!(f, "Processing"),
            Self::Validating => write!(f, "Validating"),
            Self::Registered => write!(f, "Registered"),
            Self::Skipped => write!(f, "Skipped"),
        }
    }
}
