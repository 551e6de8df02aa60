//! Want lifecycle state machine
//!
//! The reconcile loop is the only caller; agents never advance status
//! directly. Transitions are a pure function of (status, event) so the
//! table stays checkable in isolation.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::want::WantStatus;

/// Inputs to the lifecycle machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Control channel accepted and registered the want
    Admitted,
    /// Dependencies satisfied and every required capability bound
    Ready,
    /// Every Do-agent succeeded this cycle
    DoCycleSucceeded,
    /// A Do-agent returned a terminal error
    DoCycleFailed,
    /// A state change invalidated a dependency
    DependencyInvalidated,
    /// A producer emitted new data for an achieved want
    Retrigger,
    /// Explicit suspend
    Suspend,
    /// Explicit resume
    Resume,
    /// Explicit stop
    Stop,
    /// Explicit start / restart
    Start,
    /// Deletion
    Delete,
}

/// Advance `status` by `event`
///
/// Returns the next status, or `Internal` when the transition is not in
/// the table. The loop logs invalid transitions and carries on; they never
/// abort a pass.
pub fn advance(status: WantStatus, event: LifecycleEvent) -> EngineResult<WantStatus> {
    use LifecycleEvent as E;
    use WantStatus as S;

    let next = match (status, event) {
        (S::Created, E::Admitted) => S::Idle,
        (S::Idle, E::Ready) => S::Reaching,
        (S::Idle, E::Suspend) => S::Suspended,
        (S::Reaching, E::DoCycleSucceeded) => S::Achieved,
        (S::Reaching, E::DoCycleFailed) => S::Failed,
        (S::Reaching, E::DependencyInvalidated) => S::Idle,
        (S::Achieved, E::DependencyInvalidated) => S::Idle,
        (S::Achieved, E::Retrigger) => S::Reaching,
        (S::Failed, E::Start) => S::Idle,
        (S::Stopped, E::Start) => S::Idle,
        (S::Suspended, E::Resume) => S::Idle,
        (s, E::Stop) if !s.is_terminal() => S::Stopped,
        (s, E::Delete) if !s.is_terminal() => S::Terminated,
        (from, ev) => {
            return Err(EngineError::Internal(format!(
                "invalid status transition {} on {:?}",
                from, ev
            )))
        }
    };
    Ok(next)
}

/// Whether `event` is applicable to `status` at all
///
/// Used by the loop to skip no-op control commands (e.g. resuming a want
/// that is not suspended) without treating them as internal errors.
pub fn accepts(status: WantStatus, event: LifecycleEvent) -> bool {
    advance(status, event).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use WantStatus as S;

    #[test]
    fn happy_path_reaches_achieved() {
        let mut status = S::Created;
        for event in [E::Admitted, E::Ready, E::DoCycleSucceeded] {
            status = advance(status, event).unwrap();
        }
        assert_eq!(status, S::Achieved);
    }

    #[test]
    fn dependency_change_demotes_achieved() {
        assert_eq!(advance(S::Achieved, E::DependencyInvalidated).unwrap(), S::Idle);
        assert_eq!(advance(S::Reaching, E::DependencyInvalidated).unwrap(), S::Idle);
    }

    #[test]
    fn retrigger_reenters_reaching() {
        assert_eq!(advance(S::Achieved, E::Retrigger).unwrap(), S::Reaching);
    }

    #[test]
    fn failed_requires_explicit_start() {
        assert_eq!(advance(S::Failed, E::Start).unwrap(), S::Idle);
        assert!(advance(S::Failed, E::Ready).is_err());
        assert!(advance(S::Failed, E::Retrigger).is_err());
    }

    #[test]
    fn stop_and_delete_apply_everywhere_but_terminated() {
        for status in [
            S::Created,
            S::Idle,
            S::Reaching,
            S::Achieved,
            S::Failed,
            S::Stopped,
            S::Suspended,
        ] {
            assert_eq!(advance(status, E::Stop).unwrap(), S::Stopped);
            assert_eq!(advance(status, E::Delete).unwrap(), S::Terminated);
        }
        assert!(advance(S::Terminated, E::Stop).is_err());
        assert!(advance(S::Terminated, E::Delete).is_err());
    }

    #[test]
    fn terminated_is_terminal() {
        for event in [
            E::Admitted,
            E::Ready,
            E::DoCycleSucceeded,
            E::DoCycleFailed,
            E::DependencyInvalidated,
            E::Retrigger,
            E::Suspend,
            E::Resume,
            E::Stop,
            E::Start,
            E::Delete,
        ] {
            assert!(advance(S::Terminated, event).is_err());
        }
    }

    #[test]
    fn suspend_resume_round_trip() {
        let suspended = advance(S::Idle, E::Suspend).unwrap();
        assert_eq!(suspended, S::Suspended);
        assert_eq!(advance(suspended, E::Resume).unwrap(), S::Idle);
    }
}
