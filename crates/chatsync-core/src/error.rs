use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ViewLifecycleState;

/// Broad error category used for user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Input rejected locally before any remote call was made.
    Validation,
    /// Missing session, foreign ownership, or identity provider rejection.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the remote store.
    RateLimited,
    /// The remote store rejected the request (bad filter, constraint, missing row).
    Query,
    /// A row or payload could not be decoded.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload surfaced across the view command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Local validation failure; never reported to the remote side.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Validation, code, message)
    }

    /// Mutation attempted without a current session.
    pub fn not_signed_in(action: &str) -> Self {
        Self::new(
            SyncErrorCategory::Auth,
            "not_signed_in",
            format!("'{action}' requires a signed-in session"),
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ViewLifecycleState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while view is in state {current:?}"),
        )
    }

    /// The view runtime has shut down and no longer accepts commands.
    pub fn view_closed() -> Self {
        Self::new(
            SyncErrorCategory::Internal,
            "view_closed",
            "view has been closed",
        )
    }

    /// Whether this error was produced locally rather than by a remote call.
    pub fn is_local(&self) -> bool {
        self.category == SyncErrorCategory::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(ViewLifecycleState::Closed, "load_more");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
        assert!(err.message.contains("Closed"));
    }

    #[test]
    fn only_validation_errors_are_local() {
        assert!(SyncError::validation("empty_message", "blank").is_local());
        assert!(!SyncError::not_signed_in("send_message").is_local());
        assert!(!SyncError::view_closed().is_local());
    }
}
