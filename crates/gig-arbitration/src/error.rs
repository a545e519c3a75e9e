//! Dispute resolver error types.

use gig_core::{EntityKind, Rejection, Role};
use gig_escrow::EscrowError;
use thiserror::Error;

/// Errors from dispute lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisputeError {
    /// The dispute is closed.
    #[error("dispute {dispute_id} is in terminal state {state}")]
    TerminalState { dispute_id: String, state: String },

    /// The action does not apply to the current state.
    #[error("cannot {action} dispute in state {from}: {reason}")]
    InvalidTransition {
        from: String,
        action: String,
        reason: String,
    },

    /// The actor lacks authority.
    #[error("{role} may not {action}")]
    Forbidden { action: String, role: Role },

    /// Input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The resolution could not be planned.
    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

impl From<DisputeError> for Rejection {
    fn from(err: DisputeError) -> Self {
        match err {
            DisputeError::TerminalState { state, .. } => Rejection::invalid(
                EntityKind::Dispute,
                state,
                "modify",
                "dispute is closed",
            ),
            DisputeError::InvalidTransition {
                from,
                action,
                reason,
            } => Rejection::invalid(EntityKind::Dispute, from, action, reason),
            DisputeError::Forbidden { action, role } => Rejection::forbidden(action, role),
            DisputeError::Validation(msg) => Rejection::validation(msg),
            DisputeError::Escrow(e) => e.into(),
        }
    }
}
