use crate::{
    error::SyncError,
    types::{ViewEvent, ViewLifecycleState},
};

/// Work a view runtime wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAction {
    /// Request the next snapshot page.
    LoadMore,
    /// Dispatch a mutation through the gateway.
    Mutate,
    /// Apply a snapshot batch or live change to the collection.
    ApplyChange,
}

#[derive(Debug, Clone)]
pub struct ViewStateMachine {
    state: ViewLifecycleState,
}

impl Default for ViewStateMachine {
    fn default() -> Self {
        Self {
            state: ViewLifecycleState::Opening,
        }
    }
}

impl ViewStateMachine {
    pub fn state(&self) -> ViewLifecycleState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ViewLifecycleState::Closed
    }

    pub fn check(&self, action: ViewAction) -> Result<(), SyncError> {
        use ViewLifecycleState::*;

        let allowed = match action {
            ViewAction::LoadMore => self.state == Ready,
            ViewAction::Mutate | ViewAction::ApplyChange => matches!(self.state, Opening | Ready),
        };

        if allowed {
            Ok(())
        } else {
            Err(SyncError::invalid_state(self.state, action_label(action)))
        }
    }

    /// The initial snapshot finished, successfully or not.
    pub fn on_initial_settled(&mut self) -> Result<ViewEvent, SyncError> {
        if self.state != ViewLifecycleState::Opening {
            return Err(SyncError::invalid_state(self.state, "initial_settled"));
        }
        self.state = ViewLifecycleState::Ready;
        tracing::trace!(state = ?self.state, "view lifecycle transition");
        Ok(ViewEvent::StateChanged { state: self.state })
    }

    /// Enter `Closed`. Returns the transition event only the first time.
    pub fn on_closed(&mut self) -> Option<ViewEvent> {
        if self.is_closed() {
            return None;
        }
        self.state = ViewLifecycleState::Closed;
        tracing::trace!(state = ?self.state, "view lifecycle transition");
        Some(ViewEvent::StateChanged { state: self.state })
    }
}

fn action_label(action: ViewAction) -> &'static str {
    match action {
        ViewAction::LoadMore => "load_more",
        ViewAction::Mutate => "mutate",
        ViewAction::ApplyChange => "apply_change",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_happy_path_transitions() {
        let mut sm = ViewStateMachine::default();
        assert_eq!(sm.state(), ViewLifecycleState::Opening);

        let event = sm.on_initial_settled().expect("opening view should settle");
        assert_eq!(
            event,
            ViewEvent::StateChanged {
                state: ViewLifecycleState::Ready
            }
        );
        sm.check(ViewAction::LoadMore).expect("ready view pages");

        assert!(sm.on_closed().is_some());
        assert!(sm.is_closed());
    }

    #[test]
    fn rejects_load_more_before_initial_snapshot() {
        let sm = ViewStateMachine::default();
        let err = sm
            .check(ViewAction::LoadMore)
            .expect_err("load more must wait for the initial snapshot");
        assert_eq!(err.code, "invalid_state_transition");
        sm.check(ViewAction::ApplyChange)
            .expect("live changes apply while opening");
        sm.check(ViewAction::Mutate)
            .expect("mutations are allowed while opening");
    }

    #[test]
    fn closes_exactly_once() {
        let mut sm = ViewStateMachine::default();
        assert!(sm.on_closed().is_some());
        assert!(sm.on_closed().is_none());
        assert!(sm.check(ViewAction::ApplyChange).is_err());
        assert!(sm.on_initial_settled().is_err());
    }
}
