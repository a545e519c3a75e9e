//! # Rejection Taxonomy
//!
//! Every transition function in the workspace returns `Result<_, Rejection>`.
//! A rejection is part of the typed contract of the state machine, not an
//! exceptional condition: callers branch on [`Rejection::code`] and never on
//! the human-readable message.
//!
//! | Code | Meaning | Caller action |
//! |------|---------|---------------|
//! | `INVALID_TRANSITION` | action not legal from the current state | surface |
//! | `FORBIDDEN` | actor lacks authority for the action | surface |
//! | `CONFLICT` | lost a compare-and-swap race | retry with fresh state |
//! | `VALIDATION_FAILED` | malformed input, amount mismatch | surface |
//! | `SETTLEMENT_FAILED` | settlement permanently rejected an intent | remediate |
//! | `NOT_FOUND` | referenced entity absent | surface |

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::actor::Role;
use crate::amount::AmountError;

/// Kinds of entity a rejection can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A job.
    Job,
    /// A bid.
    Bid,
    /// A milestone.
    Milestone,
    /// A delivery package.
    Delivery,
    /// A dispute.
    Dispute,
    /// A settlement intent.
    Intent,
    /// A workspace session.
    Session,
    /// A review.
    Review,
    /// An invoice.
    Invoice,
}

impl EntityKind {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Bid => "bid",
            Self::Milestone => "milestone",
            Self::Delivery => "delivery",
            Self::Dispute => "dispute",
            Self::Intent => "intent",
            Self::Session => "session",
            Self::Review => "review",
            Self::Invoice => "invoice",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, machine-readable reason code for a [`Rejection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    /// Action not legal from the current state.
    InvalidTransition,
    /// Actor lacks authority.
    Forbidden,
    /// Lost a concurrency race.
    Conflict,
    /// Malformed input.
    ValidationFailed,
    /// External settlement permanently rejected an intent.
    SettlementFailed,
    /// Referenced entity absent.
    NotFound,
}

impl RejectionCode {
    /// The wire form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Forbidden => "FORBIDDEN",
            Self::Conflict => "CONFLICT",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::SettlementFailed => "SETTLEMENT_FAILED",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl std::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed refusal to apply a transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The action has no edge from the entity's current state.
    #[error("cannot {action} {entity} in state {from}: {reason}")]
    InvalidTransition {
        /// Entity kind.
        entity: EntityKind,
        /// Current state name.
        from: String,
        /// Requested action.
        action: String,
        /// Why the edge is missing or blocked.
        reason: String,
    },

    /// The actor's role does not carry authority for the action.
    #[error("{role} may not {action}")]
    Forbidden {
        /// Requested action.
        action: String,
        /// Role the actor held.
        role: Role,
    },

    /// The stored version moved since the caller read it.
    #[error("{entity} {id} changed concurrently (expected version {expected}, found {actual})")]
    Conflict {
        /// Entity kind.
        entity: EntityKind,
        /// Entity id.
        id: Uuid,
        /// Version the caller based its request on.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// Input failed validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Settlement permanently rejected an intent.
    #[error("settlement failed for intent {intent_id}: {reason}")]
    SettlementFailed {
        /// The failed intent.
        intent_id: Uuid,
        /// Reason reported by the settlement collaborator.
        reason: String,
    },

    /// Referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind.
        entity: EntityKind,
        /// Entity id.
        id: Uuid,
    },
}

impl Rejection {
    /// Shorthand for [`Rejection::InvalidTransition`].
    pub fn invalid(
        entity: EntityKind,
        from: impl std::fmt::Display,
        action: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Rejection::Forbidden`].
    pub fn forbidden(action: impl Into<String>, role: Role) -> Self {
        Self::Forbidden {
            action: action.into(),
            role,
        }
    }

    /// Shorthand for [`Rejection::NotFound`].
    pub fn not_found(entity: EntityKind, id: impl Into<Uuid>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for [`Rejection::ValidationFailed`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Shorthand for [`Rejection::Conflict`].
    pub fn conflict(entity: EntityKind, id: impl Into<Uuid>, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
            expected,
            actual,
        }
    }

    /// The stable reason code.
    pub fn code(&self) -> RejectionCode {
        match self {
            Self::InvalidTransition { .. } => RejectionCode::InvalidTransition,
            Self::Forbidden { .. } => RejectionCode::Forbidden,
            Self::Conflict { .. } => RejectionCode::Conflict,
            Self::ValidationFailed(_) => RejectionCode::ValidationFailed,
            Self::SettlementFailed { .. } => RejectionCode::SettlementFailed,
            Self::NotFound { .. } => RejectionCode::NotFound,
        }
    }

    /// Only a lost race is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<AmountError> for Rejection {
    fn from(err: AmountError) -> Self {
        Self::ValidationFailed(err.to_string())
    }
}
