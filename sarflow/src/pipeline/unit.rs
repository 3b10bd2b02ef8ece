//! Work unit tracking.
//!
//! A [`WorkUnit`] follows one request through the state machine. It is owned
//! by the task driving it; observers read its state through a watch channel
//! (see [`crate::scheduler::UnitHandle`]). When the unit reaches a terminal
//! state it is turned into a [`UnitReport`] and dropped.

use super::request::WorkRequest;
use super::state::{FailureReason, UnitState};
use super::PipelineError;
use crate::registry::SceneId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Global counter for generating unique unit IDs.
static UNIT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a work unit.
///
/// Unit IDs name the unit's scratch and result directories, so they are
/// unique across runs as well as within one: `unit-{start}-{pid}-{counter}`.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a unique auto-generated unit ID.
    pub fn auto() -> Self {
        let counter = UNIT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "unit-{}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id(),
            counter
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: UnitState,
    pub to: UnitState,
    pub at: DateTime<Utc>,
}

/// Transient tracking of one request's progress.
#[derive(Debug)]
pub struct WorkUnit {
    id: UnitId,
    request: WorkRequest,
    /// 1 for the first submission, incremented on re-queue
    attempt: u32,
    state: UnitState,
    history: Vec<Transition>,
    scene_id: Option<SceneId>,
    state_tx: watch::Sender<UnitState>,
}

impl WorkUnit {
    pub fn new(request: WorkRequest) -> Self {
        Self::with_id(UnitId::auto(), request)
    }

    pub fn with_id(id: UnitId, request: WorkRequest) -> Self {
        let (state_tx, _) = watch::channel(UnitState::Pending);
        Self {
            id,
            request,
            attempt: 1,
            state: UnitState::Pending,
            history: Vec::new(),
            scene_id: None,
            state_tx,
        }
    }

    /// A fresh unit for the same request, used when re-queueing.
    pub fn retry_of(report: &UnitReport) -> Self {
        let mut unit = Self::new(report.request.clone());
        unit.attempt = report.attempt + 1;
        unit
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn request(&self) -> &WorkRequest {
        &self.request
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> &UnitState {
        &self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn scene_id(&self) -> Option<&SceneId> {
        self.scene_id.as_ref()
    }

    pub fn set_scene_id(&mut self, scene_id: SceneId) {
        self.scene_id = Some(scene_id);
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<UnitState> {
        self.state_tx.subscribe()
    }

    /// Moves to `next`, recording the transition.
    ///
    /// Returns the transition on success; illegal moves leave the unit
    /// unchanged.
    pub fn transition(&mut self, next: UnitState) -> Result<Transition, PipelineError> {
        if !self.state.can_transition_to(&next) {
            return Err(PipelineError::IllegalTransition {
                unit: self.id.clone(),
                from: self.state.name(),
                to: next.name(),
            });
        }

        let transition = Transition {
            from: self.state.clone(),
            to: next.clone(),
            at: Utc::now(),
        };
        self.state = next.clone();
        self.history.push(transition.clone());
        self.state_tx.send_replace(next);
        Ok(transition)
    }

    /// Consumes a terminal unit into its report.
    pub fn into_report(self) -> UnitReport {
        UnitReport {
            unit_id: self.id,
            request: self.request,
            attempt: self.attempt,
            state: self.state,
            scene_id: self.scene_id,
            history: self.history,
        }
    }
}

/// Final account of one unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit_id: UnitId,
    pub request: WorkRequest,
    pub attempt: u32,
    pub state: UnitState,
    /// Registered or reused scene
    pub scene_id: Option<SceneId>,
    pub history: Vec<Transition>,
}

impl UnitReport {
    pub fn failure(&self) -> Option<&FailureReason> {
        self.state.failure()
    }

    /// State names visited, starting with `pending`.
    pub fn trace(&self) -> Vec<&'static str> {
        let mut names = vec![UnitState::Pending.name()];
        names.extend(self.history.iter().map(|t| t.to.name()));
        names
    }
}
