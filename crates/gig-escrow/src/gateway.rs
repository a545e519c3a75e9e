//! # Settlement Gateway
//!
//! The seam to the external payment collaborator. Implementations must be
//! `Send + Sync` so they can be shared behind an `Arc` across handlers, and
//! must treat the intent id as an idempotency key: dispatching the same
//! intent twice settles it once.
//!
//! [`MockSettlementGateway`] backs development and tests. It keeps a ledger
//! of credited amounts per party and can be scripted to answer with
//! transient or permanent failures.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use gig_core::{Amount, IntentId};
use parking_lot::Mutex;
use thiserror::Error;

use crate::plan::{Party, SettlementIntent};

/// A gateway's answer to a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayResponse {
    /// Settled synchronously.
    Confirmed {
        /// Gateway-side reference.
        settlement_reference: String,
    },
    /// Accepted for processing; an acknowledgment will follow.
    Accepted,
}

/// Dispatch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Worth retrying: timeouts, connection failures, 5xx, 429.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Never worth retrying: the gateway refused the instruction.
    #[error("gateway rejected intent: {0}")]
    Permanent(String),
}

impl GatewayError {
    /// Whether a retry might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outbound seam to the settlement collaborator.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Send one leg. The intent id is the idempotency key.
    async fn dispatch(&self, intent: &SettlementIntent) -> Result<GatewayResponse, GatewayError>;

    /// Implementation name for logs.
    fn name(&self) -> &str;
}

// ── Mock gateway ────────────────────────────────────────────────────────

/// A scripted answer for [`MockSettlementGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Settle and confirm.
    Confirm,
    /// Accept without confirming; expects a later acknowledgment.
    Accept,
    /// Fail transiently without settling.
    Transient,
    /// Settle, then lose the response (the caller sees a transient error).
    TransientAfterApply,
    /// Refuse permanently.
    Permanent,
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    settled: HashMap<IntentId, String>,
    credits: HashMap<Party, Amount>,
    dispatches: u32,
}

/// In-memory gateway with a credit ledger.
///
/// Unscripted dispatches confirm. A dispatch of an intent id that already
/// settled returns the original reference and credits nothing.
#[derive(Debug, Default)]
pub struct MockSettlementGateway {
    state: Mutex<MockState>,
}

impl MockSettlementGateway {
    /// A gateway that confirms everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue answers for the next dispatches, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Total credited to `party`.
    pub fn credited(&self, party: Party) -> Amount {
        self.state
            .lock()
            .credits
            .get(&party)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Number of distinct intents settled.
    pub fn settled_count(&self) -> usize {
        self.state.lock().settled.len()
    }

    /// Number of dispatch calls received.
    pub fn dispatch_count(&self) -> u32 {
        self.state.lock().dispatches
    }

    /// Mark an accepted intent as settled, as the real rail would before
    /// sending its acknowledgment. Returns the settlement reference.
    pub fn complete(&self, intent: &SettlementIntent) -> String {
        let mut state = self.state.lock();
        Self::apply(&mut state, intent)
    }

    fn apply(state: &mut MockState, intent: &SettlementIntent) -> String {
        if let Some(reference) = state.settled.get(&intent.intent_id) {
            return reference.clone();
        }
        let reference = format!("mock-{}", intent.intent_id);
        state.settled.insert(intent.intent_id, reference.clone());
        let credit = state.credits.entry(intent.to_party).or_insert(Amount::ZERO);
        *credit = credit.checked_add(intent.amount).unwrap_or(*credit);
        reference
    }
}

#[async_trait]
impl SettlementGateway for MockSettlementGateway {
    async fn dispatch(&self, intent: &SettlementIntent) -> Result<GatewayResponse, GatewayError> {
        let mut state = self.state.lock();
        state.dispatches += 1;
        if let Some(reference) = state.settled.get(&intent.intent_id) {
            return Ok(GatewayResponse::Confirmed {
                settlement_reference: reference.clone(),
            });
        }
        match state.script.pop_front().unwrap_or(MockOutcome::Confirm) {
            MockOutcome::Confirm => Ok(GatewayResponse::Confirmed {
                settlement_reference: Self::apply(&mut state, intent),
            }),
            MockOutcome::Accept => Ok(GatewayResponse::Accepted),
            MockOutcome::Transient => Err(GatewayError::Transient("mock: connection reset".into())),
            MockOutcome::TransientAfterApply => {
                Self::apply(&mut state, intent);
                Err(GatewayError::Transient("mock: response lost".into()))
            }
            MockOutcome::Permanent => Err(GatewayError::Permanent("mock: account closed".into())),
        }
    }

    fn name(&self) -> &str {
        "MockSettlementGateway"
    }
}
