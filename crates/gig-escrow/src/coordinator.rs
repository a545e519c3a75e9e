//! # Escrow Coordinator
//!
//! Dispatches planned legs to the [`SettlementGateway`], journals every
//! outcome, and answers the one question the state machine cares about:
//! has this batch fully settled?
//!
//! ## Dispatch
//!
//! 1. The leg is journaled `pending` before the gateway is called.
//! 2. Transient errors are retried with exponential backoff up to
//!    [`RetryPolicy::max_attempts`]; exhaustion marks the leg `stalled`.
//! 3. A permanent error marks the leg `failed`. Legs of the same batch that
//!    were not dispatched yet are voided.
//! 4. A confirmed leg is never dispatched again; re-submission returns the
//!    stored receipt.
//! 5. Confirmation is a compare-and-set on the journal entry. Funds that
//!    move on a leg already voided or failed mark it `orphaned`, and its
//!    batch stalls until an operator reconciles it.
//!
//! No lock is held while the gateway is awaited.

use std::sync::Arc;

use chrono::Utc;
use gig_core::{BatchId, IntentId};
use gig_state::Intent;
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::gateway::{GatewayError, GatewayResponse, SettlementGateway};
use crate::journal::{Abandoned, IntentJournal, JournalEntry, LegStatus, SettlementReceipt};
use crate::plan::{self, FeeSchedule, SettlementIntent, SettlementPlan};
use crate::retry::RetryPolicy;

/// Result of submitting one leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Funds moved.
    Confirmed { receipt: SettlementReceipt },
    /// Accepted by the gateway; waiting for an acknowledgment.
    Pending,
    /// Permanently refused.
    Failed { reason: String },
    /// Retries exhausted.
    Stalled { reason: String },
}

/// Aggregate state of a settlement batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Every live leg confirmed.
    Settled,
    /// Some legs still pending, none failed.
    Open,
    /// A leg failed permanently and none moved money.
    Failed { reason: String },
    /// Partially applied, exhausted, or confirmed after voiding.
    Stalled { reason: String },
    /// Voided before any leg moved money.
    Voided,
}

/// Status carried by an asynchronous acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Confirmed,
    Failed,
}

/// Asynchronous acknowledgment from the settlement collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAck {
    pub intent_id: IntentId,
    pub status: AckStatus,
    pub settlement_reference: Option<String>,
    /// Failure reason when `status` is `failed`.
    #[serde(default)]
    pub reason: Option<String>,
}

/// What an acknowledgment changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The leg moved to the acknowledged status.
    Applied { batch_id: BatchId },
    /// The leg already had this status.
    Duplicate { batch_id: BatchId },
    /// Money moved on a leg that had been voided or failed.
    LateConfirmation { batch_id: BatchId },
}

impl AckOutcome {
    /// Batch the acknowledged leg belongs to.
    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::Applied { batch_id }
            | Self::Duplicate { batch_id }
            | Self::LateConfirmation { batch_id } => *batch_id,
        }
    }
}

/// Result of recording a confirmation against the journal.
enum Confirmation {
    Applied(SettlementReceipt),
    /// Already confirmed; carries the stored receipt.
    Duplicate(Option<SettlementReceipt>),
    /// The leg had been voided or failed; it is now orphaned.
    Late { recorded: LegStatus },
}

/// Coordinates planning, dispatch and acknowledgment of settlement legs.
#[derive(Clone)]
pub struct EscrowCoordinator {
    gateway: Arc<dyn SettlementGateway>,
    journal: Arc<IntentJournal>,
    retry: RetryPolicy,
    fees: FeeSchedule,
}

impl std::fmt::Debug for EscrowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowCoordinator")
            .field("gateway", &self.gateway.name())
            .field("journaled", &self.journal.len())
            .field("retry", &self.retry)
            .field("fees", &self.fees)
            .finish()
    }
}

impl EscrowCoordinator {
    /// Build a coordinator over `gateway`.
    pub fn new(
        gateway: Arc<dyn SettlementGateway>,
        journal: Arc<IntentJournal>,
        retry: RetryPolicy,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            gateway,
            journal,
            retry,
            fees,
        }
    }

    /// Journal shared with persistence.
    pub fn journal(&self) -> &Arc<IntentJournal> {
        &self.journal
    }

    /// Active fee schedule.
    pub fn fees(&self) -> FeeSchedule {
        self.fees
    }

    /// Compute the legs for `intent`.
    pub fn plan(&self, intent: &Intent) -> Result<SettlementPlan, EscrowError> {
        plan::plan(intent, &self.fees)
    }

    /// Journal every leg of `plan` as pending without dispatching.
    pub fn register(&self, plan: &SettlementPlan) -> Vec<JournalEntry> {
        let now = Utc::now();
        plan.legs
            .iter()
            .map(|leg| self.journal.record(leg, now))
            .collect()
    }

    /// Dispatch every leg of `plan` in order and report the batch outcome.
    pub async fn submit_plan(&self, plan: &SettlementPlan) -> Result<BatchOutcome, EscrowError> {
        self.register(plan);
        for leg in &plan.legs {
            match self.submit_intent(leg).await {
                Ok(SubmitOutcome::Failed { .. }) => {
                    self.journal.void_open(&plan.batch_id, Utc::now());
                    break;
                }
                Ok(_) => {}
                // A concurrent dispute voided the rest of the batch.
                Err(EscrowError::Voided(_)) => break,
                Err(e) => return Err(e),
            }
        }
        self.batch_outcome(&plan.batch_id)
    }

    /// Dispatch one leg, retrying transient failures.
    pub async fn submit_intent(&self, leg: &SettlementIntent) -> Result<SubmitOutcome, EscrowError> {
        let entry = self.journal.record(leg, Utc::now());
        match entry.status {
            LegStatus::Confirmed => {
                if let Some(receipt) = entry.receipt {
                    return Ok(SubmitOutcome::Confirmed { receipt });
                }
            }
            LegStatus::Failed => {
                return Ok(SubmitOutcome::Failed {
                    reason: entry.last_error.unwrap_or_default(),
                })
            }
            LegStatus::Voided => return Err(EscrowError::Voided(leg.intent_id)),
            LegStatus::Orphaned => {
                return Ok(SubmitOutcome::Stalled {
                    reason: "funds moved on an abandoned leg".into(),
                })
            }
            LegStatus::Pending | LegStatus::Stalled => {}
        }
        self.dispatch_with_retry(leg).await
    }

    /// Operator re-dispatch of a stalled leg.
    pub async fn retry_stalled(&self, intent_id: &IntentId) -> Result<SubmitOutcome, EscrowError> {
        let entry = self
            .journal
            .get(intent_id)
            .ok_or(EscrowError::UnknownIntent(*intent_id))?;
        if entry.status != LegStatus::Stalled {
            return Err(EscrowError::NotStalled {
                intent_id: *intent_id,
                status: entry.status,
            });
        }
        tracing::info!(intent_id = %intent_id, attempts = entry.attempts, "retrying stalled settlement leg");
        self.dispatch_with_retry(&entry.intent).await
    }

    async fn dispatch_with_retry(&self, leg: &SettlementIntent) -> Result<SubmitOutcome, EscrowError> {
        let id = leg.intent_id;
        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            let claimed = self
                .journal
                .transition(&id, Utc::now(), &[LegStatus::Pending, LegStatus::Stalled], |e| {
                    e.attempts += 1;
                    e.status = LegStatus::Pending;
                })
                .ok_or(EscrowError::UnknownIntent(id))?;
            if let Err(found) = claimed {
                return match (found.status, found.receipt) {
                    (LegStatus::Confirmed, Some(receipt)) => Ok(SubmitOutcome::Confirmed { receipt }),
                    (LegStatus::Failed, _) => Ok(SubmitOutcome::Failed {
                        reason: found.last_error.unwrap_or_default(),
                    }),
                    (LegStatus::Orphaned, _) => Ok(SubmitOutcome::Stalled {
                        reason: "funds moved on an abandoned leg".into(),
                    }),
                    _ => Err(EscrowError::Voided(id)),
                };
            }

            match self.gateway.dispatch(leg).await {
                Ok(GatewayResponse::Confirmed {
                    settlement_reference,
                }) => {
                    return match self.confirm(&id, settlement_reference)? {
                        Confirmation::Applied(receipt) => {
                            tracing::info!(
                                intent_id = %id,
                                batch_id = %leg.batch_id,
                                amount = %leg.amount,
                                to = %leg.to_party,
                                "settlement leg confirmed"
                            );
                            Ok(SubmitOutcome::Confirmed { receipt })
                        }
                        Confirmation::Duplicate(Some(receipt)) => Ok(SubmitOutcome::Confirmed { receipt }),
                        Confirmation::Duplicate(None) => Ok(SubmitOutcome::Stalled {
                            reason: "funds moved on an abandoned leg".into(),
                        }),
                        Confirmation::Late { recorded } => {
                            tracing::error!(
                                intent_id = %id,
                                batch_id = %leg.batch_id,
                                amount = %leg.amount,
                                %recorded,
                                "settlement confirmed after the leg was abandoned"
                            );
                            Ok(SubmitOutcome::Stalled {
                                reason: format!("funds moved after the leg was {recorded}"),
                            })
                        }
                    };
                }
                Ok(GatewayResponse::Accepted) => {
                    tracing::debug!(intent_id = %id, "settlement leg accepted, awaiting acknowledgment");
                    return Ok(SubmitOutcome::Pending);
                }
                Err(GatewayError::Permanent(reason)) => {
                    self.journal.transition(&id, Utc::now(), &[LegStatus::Pending], |e| {
                        e.status = LegStatus::Failed;
                        e.last_error = Some(reason.clone());
                    });
                    tracing::error!(intent_id = %id, batch_id = %leg.batch_id, %reason, "settlement leg failed permanently");
                    return Ok(SubmitOutcome::Failed { reason });
                }
                Err(GatewayError::Transient(reason)) => {
                    last_error = reason;
                    self.journal.update(&id, Utc::now(), |e| {
                        e.last_error = Some(last_error.clone());
                    });
                    if attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.delay_for(attempt);
                        tracing::warn!(
                            intent_id = %id,
                            attempt = attempt + 1,
                            max_attempts = self.retry.max_attempts,
                            "settlement dispatch failed, retrying in {delay:?}: {last_error}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.journal
            .transition(&id, Utc::now(), &[LegStatus::Pending], |e| e.status = LegStatus::Stalled);
        tracing::error!(
            intent_id = %id,
            batch_id = %leg.batch_id,
            attempts = self.retry.max_attempts,
            "settlement retries exhausted: {last_error}"
        );
        Ok(SubmitOutcome::Stalled { reason: last_error })
    }

    /// Record funds moving on a leg. Only an open leg becomes confirmed; a
    /// voided or failed one becomes orphaned.
    fn confirm(&self, id: &IntentId, settlement_reference: String) -> Result<Confirmation, EscrowError> {
        let now = Utc::now();
        let receipt = SettlementReceipt {
            intent_id: *id,
            settlement_reference,
            confirmed_at: now,
        };
        let found = match self
            .journal
            .transition(id, now, &[LegStatus::Pending, LegStatus::Stalled], |e| {
                e.status = LegStatus::Confirmed;
                e.receipt = Some(receipt.clone());
                e.last_error = None;
            })
            .ok_or(EscrowError::UnknownIntent(*id))?
        {
            Ok(_) => return Ok(Confirmation::Applied(receipt)),
            Err(found) => found,
        };
        if found.status.moved_funds() {
            return Ok(Confirmation::Duplicate(found.receipt));
        }
        let recorded = found.status;
        match self.journal.transition(id, now, &[recorded], |e| {
            e.status = LegStatus::Orphaned;
            e.receipt = Some(receipt.clone());
        }) {
            Some(Ok(_)) => Ok(Confirmation::Late { recorded }),
            Some(Err(again)) => Ok(Confirmation::Duplicate(again.receipt)),
            None => Err(EscrowError::UnknownIntent(*id)),
        }
    }

    /// Apply an asynchronous acknowledgment. Repeats are no-ops.
    pub fn acknowledge(&self, ack: &SettlementAck) -> Result<AckOutcome, EscrowError> {
        let id = ack.intent_id;
        let batch_id = self
            .journal
            .get(&id)
            .ok_or(EscrowError::UnknownIntent(id))?
            .intent
            .batch_id;

        match ack.status {
            AckStatus::Confirmed => match self.confirm(&id, reference_or_default(ack))? {
                Confirmation::Applied(_) => Ok(AckOutcome::Applied { batch_id }),
                Confirmation::Duplicate(_) => Ok(AckOutcome::Duplicate { batch_id }),
                Confirmation::Late { recorded } => {
                    tracing::error!(intent_id = %id, batch_id = %batch_id, %recorded, "settlement confirmed after the leg was abandoned");
                    Ok(AckOutcome::LateConfirmation { batch_id })
                }
            },
            AckStatus::Failed => {
                let reason = ack
                    .reason
                    .clone()
                    .unwrap_or_else(|| "failure acknowledged by gateway".into());
                let applied = self
                    .journal
                    .transition(&id, Utc::now(), &[LegStatus::Pending, LegStatus::Stalled], |e| {
                        e.status = LegStatus::Failed;
                        e.last_error = Some(reason);
                    })
                    .ok_or(EscrowError::UnknownIntent(id))?;
                match applied {
                    Ok(_) => {
                        self.journal.void_open(&batch_id, Utc::now());
                        Ok(AckOutcome::Applied { batch_id })
                    }
                    Err(found) if matches!(found.status, LegStatus::Failed | LegStatus::Voided) => {
                        Ok(AckOutcome::Duplicate { batch_id })
                    }
                    Err(found) => Err(EscrowError::AckConflict {
                        intent_id: id,
                        recorded: found.status,
                    }),
                }
            }
        }
    }

    /// Aggregate the legs of a batch.
    pub fn batch_outcome(&self, batch_id: &BatchId) -> Result<BatchOutcome, EscrowError> {
        let legs = self.journal.batch(batch_id);
        if legs.is_empty() {
            return Err(EscrowError::UnknownBatch(*batch_id));
        }
        let count = |s: LegStatus| legs.iter().filter(|l| l.status == s).count();
        let confirmed = count(LegStatus::Confirmed);
        let orphaned = count(LegStatus::Orphaned);
        let failed = count(LegStatus::Failed);
        let stalled = count(LegStatus::Stalled);
        let voided = count(LegStatus::Voided);
        let pending = count(LegStatus::Pending);
        let first_error = || {
            legs.iter()
                .find_map(|l| l.last_error.clone())
                .unwrap_or_default()
        };

        let outcome = if confirmed == legs.len() {
            BatchOutcome::Settled
        } else if orphaned > 0 {
            BatchOutcome::Stalled {
                reason: format!("funds moved on {orphaned} abandoned leg(s)"),
            }
        } else if failed > 0 && confirmed == 0 {
            BatchOutcome::Failed {
                reason: first_error(),
            }
        } else if failed > 0 {
            BatchOutcome::Stalled {
                reason: format!("{confirmed} of {} legs settled before a failure", legs.len()),
            }
        } else if stalled > 0 {
            BatchOutcome::Stalled {
                reason: first_error(),
            }
        } else if voided == legs.len() {
            BatchOutcome::Voided
        } else if voided > 0 && confirmed > 0 {
            BatchOutcome::Stalled {
                reason: "funds moved on a voided batch".into(),
            }
        } else if pending > 0 {
            BatchOutcome::Open
        } else {
            BatchOutcome::Voided
        };
        Ok(outcome)
    }

    /// Fail when any leg of the batch has already moved money.
    pub fn ensure_unsettled(&self, batch_id: &BatchId) -> Result<(), EscrowError> {
        let legs = self.journal.batch(batch_id);
        if legs.is_empty() {
            return Err(EscrowError::UnknownBatch(*batch_id));
        }
        if legs.iter().any(|l| l.status.moved_funds()) {
            return Err(EscrowError::AlreadySettled {
                batch_id: *batch_id,
            });
        }
        Ok(())
    }

    /// Abandon a batch its milestone no longer holds. Open legs are voided;
    /// a leg that confirmed in the meantime becomes orphaned.
    pub fn abandon_batch(&self, batch_id: &BatchId) -> Result<Abandoned, EscrowError> {
        let report = self.journal.abandon(batch_id, Utc::now());
        if report.legs == 0 {
            return Err(EscrowError::UnknownBatch(*batch_id));
        }
        if report.orphaned > 0 {
            tracing::error!(batch_id = %batch_id, orphaned = report.orphaned, "abandoned settlement batch had already moved funds");
        } else {
            tracing::info!(batch_id = %batch_id, voided = report.voided, "settlement batch voided");
        }
        Ok(report)
    }

    /// Whether funds moved on a leg of the batch after it was abandoned.
    pub fn has_orphaned_legs(&self, batch_id: &BatchId) -> bool {
        self.journal
            .batch(batch_id)
            .iter()
            .any(|l| l.status == LegStatus::Orphaned)
    }

    /// Receipts of the confirmed legs of a batch.
    pub fn receipts(&self, batch_id: &BatchId) -> Vec<(SettlementIntent, SettlementReceipt)> {
        self.journal
            .batch(batch_id)
            .into_iter()
            .filter_map(|e| e.receipt.map(|r| (e.intent, r)))
            .collect()
    }
}

fn reference_or_default(ack: &SettlementAck) -> String {
    ack.settlement_reference
        .clone()
        .unwrap_or_else(|| format!("ack-{}", ack.intent_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockOutcome, MockSettlementGateway};
    use crate::plan::Party;
    use gig_core::{Amount, JobId, MilestoneId, UserId};
    use std::time::Duration;

    struct Harness {
        gateway: Arc<MockSettlementGateway>,
        coordinator: EscrowCoordinator,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(MockSettlementGateway::new());
        let coordinator = EscrowCoordinator::new(
            gateway.clone(),
            Arc::new(IntentJournal::new()),
            RetryPolicy::new(3, Duration::from_millis(1)),
            FeeSchedule::default(),
        );
        Harness {
            gateway,
            coordinator,
        }
    }

    fn split_plan(h: &Harness, freelancer: UserId, client: UserId) -> SettlementPlan {
        h.coordinator
            .plan(&Intent::split(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(1000).unwrap(),
                client,
                freelancer,
                Amount::from_major(600).unwrap(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn plan_settles_and_credits_once() {
        let h = harness();
        let (f, c) = (UserId::new(), UserId::new());
        let p = split_plan(&h, f, c);
        assert_eq!(h.coordinator.submit_plan(&p).await.unwrap(), BatchOutcome::Settled);
        assert_eq!(h.gateway.credited(Party::Freelancer(f)), Amount::from_major(600).unwrap());
        assert_eq!(h.gateway.credited(Party::Client(c)), Amount::from_major(400).unwrap());

        // Re-submitting returns stored receipts without another gateway call.
        let calls = h.gateway.dispatch_count();
        assert_eq!(h.coordinator.submit_plan(&p).await.unwrap(), BatchOutcome::Settled);
        assert_eq!(h.gateway.dispatch_count(), calls);
    }

    #[tokio::test]
    async fn transient_retry_never_double_credits() {
        let h = harness();
        h.gateway
            .script([MockOutcome::TransientAfterApply, MockOutcome::Transient]);
        let f = UserId::new();
        let p = h
            .coordinator
            .plan(&Intent::release(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(250).unwrap(),
                UserId::new(),
                f,
            ))
            .unwrap();
        let outcome = h.coordinator.submit_plan(&p).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Settled);
        assert_eq!(h.gateway.credited(Party::Freelancer(f)), Amount::from_major(250).unwrap());
        assert_eq!(h.coordinator.journal().get(&p.legs[0].intent_id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn exhaustion_stalls_and_operator_retry_recovers() {
        let h = harness();
        h.gateway.script([
            MockOutcome::Transient,
            MockOutcome::Transient,
            MockOutcome::Transient,
        ]);
        let p = h
            .coordinator
            .plan(&Intent::refund(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(10).unwrap(),
                UserId::new(),
                None,
            ))
            .unwrap();
        assert!(matches!(
            h.coordinator.submit_plan(&p).await.unwrap(),
            BatchOutcome::Stalled { .. }
        ));
        let id = p.legs[0].intent_id;
        assert!(matches!(
            h.coordinator.retry_stalled(&id).await.unwrap(),
            SubmitOutcome::Confirmed { .. }
        ));
        assert_eq!(h.coordinator.batch_outcome(&p.batch_id).unwrap(), BatchOutcome::Settled);
        assert!(matches!(
            h.coordinator.retry_stalled(&id).await,
            Err(EscrowError::NotStalled { .. })
        ));
    }

    #[tokio::test]
    async fn first_leg_permanent_failure_fails_batch() {
        let h = harness();
        h.gateway.script([MockOutcome::Permanent]);
        let p = split_plan(&h, UserId::new(), UserId::new());
        assert!(matches!(
            h.coordinator.submit_plan(&p).await.unwrap(),
            BatchOutcome::Failed { .. }
        ));
        // The undispatched second leg is voided, never sent.
        assert_eq!(h.gateway.dispatch_count(), 1);
        let second = h.coordinator.journal().get(&p.legs[1].intent_id).unwrap();
        assert_eq!(second.status, LegStatus::Voided);
    }

    #[tokio::test]
    async fn partial_failure_stalls_batch() {
        let h = harness();
        h.gateway.script([MockOutcome::Confirm, MockOutcome::Permanent]);
        let p = split_plan(&h, UserId::new(), UserId::new());
        assert!(matches!(
            h.coordinator.submit_plan(&p).await.unwrap(),
            BatchOutcome::Stalled { .. }
        ));
    }

    #[tokio::test]
    async fn async_ack_is_idempotent() {
        let h = harness();
        h.gateway.script([MockOutcome::Accept]);
        let p = h
            .coordinator
            .plan(&Intent::fund(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(5).unwrap(),
                UserId::new(),
                None,
            ))
            .unwrap();
        assert_eq!(h.coordinator.submit_plan(&p).await.unwrap(), BatchOutcome::Open);

        let ack = SettlementAck {
            intent_id: p.legs[0].intent_id,
            status: AckStatus::Confirmed,
            settlement_reference: Some("rail-77".into()),
            reason: None,
        };
        assert!(matches!(
            h.coordinator.acknowledge(&ack).unwrap(),
            AckOutcome::Applied { .. }
        ));
        assert!(matches!(
            h.coordinator.acknowledge(&ack).unwrap(),
            AckOutcome::Duplicate { .. }
        ));
        assert_eq!(h.coordinator.batch_outcome(&p.batch_id).unwrap(), BatchOutcome::Settled);

        let contradicting = SettlementAck {
            status: AckStatus::Failed,
            ..ack
        };
        assert!(matches!(
            h.coordinator.acknowledge(&contradicting),
            Err(EscrowError::AckConflict { .. })
        ));
    }

    #[tokio::test]
    async fn abandon_then_late_confirmation_orphans_the_leg() {
        let h = harness();
        h.gateway.script([MockOutcome::Accept]);
        let p = h
            .coordinator
            .plan(&Intent::release(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(80).unwrap(),
                UserId::new(),
                UserId::new(),
            ))
            .unwrap();
        h.coordinator.submit_plan(&p).await.unwrap();
        h.coordinator.ensure_unsettled(&p.batch_id).unwrap();
        assert_eq!(h.coordinator.abandon_batch(&p.batch_id).unwrap().voided, 1);
        assert_eq!(h.coordinator.batch_outcome(&p.batch_id).unwrap(), BatchOutcome::Voided);
        assert!(!h.coordinator.has_orphaned_legs(&p.batch_id));

        let ack = SettlementAck {
            intent_id: p.legs[0].intent_id,
            status: AckStatus::Confirmed,
            settlement_reference: None,
            reason: None,
        };
        assert!(matches!(
            h.coordinator.acknowledge(&ack).unwrap(),
            AckOutcome::LateConfirmation { .. }
        ));
        let leg = h.coordinator.journal().get(&p.legs[0].intent_id).unwrap();
        assert_eq!(leg.status, LegStatus::Orphaned);
        assert!(leg.receipt.is_some());
        assert!(h.coordinator.has_orphaned_legs(&p.batch_id));
        assert!(matches!(
            h.coordinator.batch_outcome(&p.batch_id).unwrap(),
            BatchOutcome::Stalled { .. }
        ));
        assert!(matches!(
            h.coordinator.ensure_unsettled(&p.batch_id),
            Err(EscrowError::AlreadySettled { .. })
        ));
        assert!(matches!(
            h.coordinator.acknowledge(&ack).unwrap(),
            AckOutcome::Duplicate { .. }
        ));
    }

    /// Holds every dispatch until released, then answers through the mock.
    struct GatedGateway {
        inner: MockSettlementGateway,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl SettlementGateway for GatedGateway {
        async fn dispatch(&self, intent: &SettlementIntent) -> Result<GatewayResponse, GatewayError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.dispatch(intent).await
        }

        fn name(&self) -> &str {
            "gated"
        }
    }

    #[tokio::test]
    async fn confirmation_after_abandon_does_not_settle_the_leg() {
        let gateway = Arc::new(GatedGateway {
            inner: MockSettlementGateway::new(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let coordinator = EscrowCoordinator::new(
            gateway.clone(),
            Arc::new(IntentJournal::new()),
            RetryPolicy::new(3, Duration::from_millis(1)),
            FeeSchedule::default(),
        );
        let f = UserId::new();
        let p = coordinator
            .plan(&Intent::release(
                JobId::new(),
                MilestoneId::new(),
                Amount::from_major(1000).unwrap(),
                UserId::new(),
                f,
            ))
            .unwrap();

        let in_flight = tokio::spawn({
            let coordinator = coordinator.clone();
            let p = p.clone();
            async move { coordinator.submit_plan(&p).await }
        });
        gateway.entered.notified().await;
        let abandoned = coordinator.abandon_batch(&p.batch_id).unwrap();
        assert_eq!(abandoned.voided, 1);
        gateway.release.notify_one();

        let outcome = in_flight.await.unwrap().unwrap();
        assert!(matches!(outcome, BatchOutcome::Stalled { .. }), "{outcome:?}");
        assert_eq!(gateway.inner.credited(Party::Freelancer(f)), Amount::from_major(1000).unwrap());
        let leg = coordinator.journal().get(&p.legs[0].intent_id).unwrap();
        assert_eq!(leg.status, LegStatus::Orphaned);
        assert!(coordinator.has_orphaned_legs(&p.batch_id));
    }

    #[test]
    fn unknown_batch_is_reported() {
        let h = harness();
        assert!(matches!(
            h.coordinator.batch_outcome(&BatchId::new()),
            Err(EscrowError::UnknownBatch(_))
        ));
    }
}
