//! Handle for observing a submitted unit.

use crate::pipeline::{UnitId, UnitState};
use tokio::sync::watch;

/// Read-only view of a submitted unit.
///
/// Cloneable; all clones observe the same unit.
#[derive(Clone)]
pub struct UnitHandle {
    unit_id: UnitId,
    state_rx: watch::Receiver<UnitState>,
}

impl UnitHandle {
    pub(crate) fn new(unit_id: UnitId, state_rx: watch::Receiver<UnitState>) -> Self {
        Self { unit_id, state_rx }
    }

    pub fn id(&self) -> &UnitId {
        &self.unit_id
    }

    /// Most recent state, without waiting.
    pub fn state(&self) -> UnitState {
        self.state_rx.borrow().clone()
    }

    /// Waits until the unit reaches a terminal state and returns it.
    ///
    /// If the unit's task ends without a terminal transition (a panic), the
    /// last observed state is returned.
    pub async fn wait(&mut self) -> UnitState {
        loop {
            let state = self.state_rx.borrow_and_update().clone();
            if state.is_terminal() {
                return state;
            }
            if self.state_rx.changed().await.is_err() {
                return self.state_rx.borrow().clone();
            }
        }
    }
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("unit_id", &self.unit_id)
            .field("state", &self.state_rx.borrow().name())
            .finish()
    }
}
