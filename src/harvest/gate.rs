//! Admission control for harvest runs.

use std::sync::{Arc, Mutex, PoisonError};

/// Whether a harvest run is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Running,
}

/// Two-state flag that admits at most one run at a time.
///
/// Clones share the same flag, so a control layer can hold one clone to
/// refuse new runs while the pipeline holds another. A run in progress can
/// never be aborted through the gate.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    state: Arc<Mutex<RunState>>,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the gate from `Idle` to `Running`.
    ///
    /// Returns `None` if a run is already active. The returned guard puts the
    /// gate back to `Idle` when dropped, including on error paths.
    pub fn try_acquire(&self) -> Option<RunGuard> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            RunState::Running => None,
            RunState::Idle => {
                *state = RunState::Running;
                Some(RunGuard {
                    state: Arc::clone(&self.state),
                })
            }
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of admission; releases the gate on drop.
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<Mutex<RunState>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RunState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_admission() {
        let gate = RunGate::new();
        let control = gate.clone();

        let guard = gate.try_acquire().expect("idle gate admits");
        assert_eq!(control.state(), RunState::Running);
        assert!(control.try_acquire().is_none());

        drop(guard);
        assert_eq!(control.state(), RunState::Idle);
        assert!(control.try_acquire().is_some());
    }
}
