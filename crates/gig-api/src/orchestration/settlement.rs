//! Settlement acknowledgments and operator retry.
//!
//! Both paths end the same way as an inline dispatch: the batch outcome is
//! re-aggregated and folded into the milestone that owns it.

use gig_core::{BatchId, IntentId, JobId, MilestoneId};
use gig_escrow::{AckOutcome, BatchOutcome, JournalEntry, LegStatus, SettlementAck};
use gig_state::Milestone;
use serde::Serialize;

use super::{outcome_label, Marketplace};
use crate::auth::CallerIdentity;
use crate::error::AppError;

/// Where a settlement batch stands after an acknowledgment or retry.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementUpdate {
    pub batch_id: BatchId,
    pub batch_outcome: BatchOutcome,
    pub milestone: Milestone,
}

impl Marketplace {
    /// Apply an asynchronous acknowledgment from the settlement rail.
    /// Repeated acknowledgments change nothing.
    pub async fn acknowledge_settlement(
        &self,
        caller: &CallerIdentity,
        ack: SettlementAck,
    ) -> Result<SettlementUpdate, AppError> {
        caller.require_system()?;
        let result = self.escrow.acknowledge(&ack).map_err(AppError::from);
        let outcome = self.observe("settlement", "acknowledge", result)?;
        let (job_id, milestone_id) = self.owner_of(&ack.intent_id)?;
        let batch_id = outcome.batch_id();

        match outcome {
            AckOutcome::Applied { .. } | AckOutcome::LateConfirmation { .. } => {
                let batch_outcome = self.escrow.batch_outcome(&batch_id)?;
                self.metrics.record_settlement(outcome_label(&batch_outcome));
                self.settle_batch(job_id, milestone_id, batch_id, &batch_outcome).await?;
            }
            AckOutcome::Duplicate { .. } => {
                tracing::debug!(intent_id = %ack.intent_id, "duplicate settlement acknowledgment ignored");
            }
        }
        self.update_for(batch_id, milestone_id)
    }

    /// Operator re-dispatch of a stalled leg.
    pub async fn retry_stalled(
        &self,
        caller: &CallerIdentity,
        intent_id: IntentId,
    ) -> Result<SettlementUpdate, AppError> {
        caller.require_system()?;
        let (job_id, milestone_id) = self.owner_of(&intent_id)?;
        let result = self.escrow.retry_stalled(&intent_id).await.map_err(AppError::from);
        let submitted = self.observe("settlement", "retry", result)?;
        tracing::info!(intent_id = %intent_id, outcome = ?submitted, "stalled settlement leg retried");

        let batch_id = self
            .escrow
            .journal()
            .get(&intent_id)
            .map(|e| e.intent.batch_id)
            .ok_or_else(|| AppError::NotFound(format!("settlement intent {intent_id}")))?;
        let batch_outcome = self.escrow.batch_outcome(&batch_id)?;
        self.metrics.record_settlement(outcome_label(&batch_outcome));
        self.settle_batch(job_id, milestone_id, batch_id, &batch_outcome).await?;
        self.update_for(batch_id, milestone_id)
    }

    /// Journal legs waiting on an operator, oldest first.
    pub fn stalled_intents(&self) -> Vec<JournalEntry> {
        let mut entries = self.escrow.journal().with_status(LegStatus::Stalled);
        entries.extend(self.escrow.journal().with_status(LegStatus::Orphaned));
        entries.sort_by_key(|e| e.recorded_at);
        entries
    }

    /// Every journaled leg of a batch.
    pub fn settlement_batch(&self, batch_id: BatchId) -> Result<Vec<JournalEntry>, AppError> {
        let legs = self.escrow.journal().batch(&batch_id);
        if legs.is_empty() {
            return Err(AppError::NotFound(format!("settlement batch {batch_id}")));
        }
        Ok(legs)
    }

    async fn settle_batch(
        &self,
        job_id: JobId,
        milestone_id: MilestoneId,
        batch_id: BatchId,
        outcome: &BatchOutcome,
    ) -> Result<(), AppError> {
        self.persist_batch(&batch_id).await;
        if let Some(committed) = self.apply_batch_outcome(job_id, milestone_id, batch_id, outcome)? {
            self.finish(committed).await;
        }
        Ok(())
    }

    fn owner_of(&self, intent_id: &IntentId) -> Result<(JobId, MilestoneId), AppError> {
        self.escrow
            .journal()
            .get(intent_id)
            .map(|e| (e.intent.job_id, e.intent.milestone_id))
            .ok_or_else(|| AppError::NotFound(format!("settlement intent {intent_id}")))
    }

    fn update_for(&self, batch_id: BatchId, milestone_id: MilestoneId) -> Result<SettlementUpdate, AppError> {
        Ok(SettlementUpdate {
            batch_id,
            batch_outcome: self.escrow.batch_outcome(&batch_id)?,
            milestone: self.milestones.require(milestone_id)?,
        })
    }
}
