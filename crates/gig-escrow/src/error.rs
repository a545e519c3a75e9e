//! Escrow coordinator error types.

use gig_core::{Amount, AmountError, BatchId, EntityKind, IntentId, Rejection};
use thiserror::Error;

use crate::journal::LegStatus;

/// Errors raised while planning, dispatching or acknowledging settlement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// Split shares do not add up to the disputed amount.
    #[error("split {freelancer} + {client} does not equal disputed amount {disputed}")]
    InvalidSplit {
        disputed: Amount,
        freelancer: Amount,
        client: Amount,
    },

    /// Fee rate outside 0..=10000 basis points.
    #[error("platform fee of {0} bps is out of range")]
    InvalidFee(u32),

    /// An intent lacks a party its kind requires.
    #[error("{kind} intent has no {party}")]
    MissingParty {
        kind: &'static str,
        party: &'static str,
    },

    /// Checked arithmetic failed.
    #[error(transparent)]
    Arithmetic(#[from] AmountError),

    /// No journal entry for the intent.
    #[error("settlement intent {0} not found")]
    UnknownIntent(IntentId),

    /// No journal entries for the batch.
    #[error("settlement batch {0} not found")]
    UnknownBatch(BatchId),

    /// A leg of the batch has already moved money.
    #[error("settlement batch {batch_id} already has a confirmed leg")]
    AlreadySettled { batch_id: BatchId },

    /// The acknowledgment contradicts the recorded outcome.
    #[error("acknowledgment for {intent_id} conflicts with recorded status {recorded}")]
    AckConflict {
        intent_id: IntentId,
        recorded: LegStatus,
    },

    /// The leg was voided and may not be dispatched.
    #[error("settlement intent {0} was voided")]
    Voided(IntentId),

    /// Only stalled legs may be retried by an operator.
    #[error("settlement intent {intent_id} is {status}, not stalled")]
    NotStalled {
        intent_id: IntentId,
        status: LegStatus,
    },
}

impl From<EscrowError> for Rejection {
    fn from(err: EscrowError) -> Self {
        match err {
            EscrowError::UnknownIntent(id) => Rejection::not_found(EntityKind::Intent, id),
            EscrowError::UnknownBatch(id) => Rejection::not_found(EntityKind::Intent, id),
            EscrowError::AlreadySettled { batch_id } => Rejection::invalid(
                EntityKind::Intent,
                LegStatus::Confirmed,
                "void",
                format!("batch {batch_id} has already moved funds"),
            ),
            EscrowError::AckConflict { recorded, .. } => Rejection::invalid(
                EntityKind::Intent,
                recorded,
                "acknowledge",
                err.to_string(),
            ),
            EscrowError::Voided(_) => Rejection::invalid(
                EntityKind::Intent,
                LegStatus::Voided,
                "dispatch",
                err.to_string(),
            ),
            EscrowError::NotStalled { status, .. } => {
                Rejection::invalid(EntityKind::Intent, status, "retry", err.to_string())
            }
            EscrowError::InvalidSplit { .. }
            | EscrowError::InvalidFee(_)
            | EscrowError::MissingParty { .. }
            | EscrowError::Arithmetic(_) => Rejection::validation(err.to_string()),
        }
    }
}
