//! Lifecycle Orchestrator
//!
//! Drives builds and teardowns across the target stores. Each target moves
//! through its own [`TargetState`] machine; targets never wait on each other.

mod gate;
mod orchestrator;
mod report;

pub use gate::{ConfirmationGate, ConfirmationPrompt, Decision};
#[cfg(test)]
pub use gate::Deny;
pub use orchestrator::{Orchestrator, TargetStatus};
pub use report::RunReport;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-target state
///
/// Build: `Pending → Creating → Ready | Failed`.
/// Teardown: `Ready → Cleaning → Empty | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Creating,
    Ready,
    Cleaning,
    Empty,
    Failed,
}

impl TargetState {
    pub fn is_transitioning(&self) -> bool {
        matches!(self, TargetState::Creating | TargetState::Cleaning)
    }

    /// Whether `next` may follow the current state
    pub fn can_enter(&self, next: TargetState) -> bool {
        use TargetState::*;
        match next {
            // A target mid-transition cannot start another one
            Creating | Cleaning => !self.is_transitioning(),
            Ready => *self == Creating,
            Empty => *self == Cleaning,
            Failed => self.is_transitioning(),
            Pending => false,
        }
    }
}

/// Cooperative cancellation shared by every stage of a run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles belong to the same run
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use TargetState::*;
        assert!(Pending.can_enter(Creating));
        assert!(Creating.can_enter(Ready));
        assert!(Creating.can_enter(Failed));
        assert!(Ready.can_enter(Cleaning));
        assert!(Cleaning.can_enter(Empty));
        assert!(Failed.can_enter(Creating));
        assert!(Empty.can_enter(Creating));
        assert!(Pending.can_enter(Cleaning));

        assert!(!Creating.can_enter(Cleaning));
        assert!(!Cleaning.can_enter(Creating));
        assert!(!Pending.can_enter(Ready));
        assert!(!Ready.can_enter(Empty));
        assert!(!Ready.can_enter(Failed));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
