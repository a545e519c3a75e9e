//! Dispute operations.
//!
//! Raising a dispute freezes the milestone. A release in flight is refused
//! if it already moved money, and is abandoned once the dispute commits; a
//! leg that confirms after that point is orphaned and the milestone stalls
//! for an operator. Resolution hands the arbiter's ruling to
//! escrow as a new batch; dismissal restores the milestone and, if it had
//! been approved, re-plans the release the dispute interrupted.

use chrono::{DateTime, Utc};
use gig_arbitration::{Dispute, ResolutionAction};
use gig_core::{BatchId, DisputeId, EntityKind, MilestoneId, Rejection};
use gig_escrow::EscrowError;
use gig_state::{Intent, Job, MilestoneAction, MilestoneStatus};

use super::{Committed, Marketplace, Staged};
use crate::auth::CallerIdentity;
use crate::error::AppError;

impl Marketplace {
    /// Client or freelancer contests a submitted or approved milestone.
    pub async fn raise_dispute(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        reason: String,
    ) -> Result<Dispute, AppError> {
        let job_id = self.milestones.require(milestone_id)?.job_id;
        let result = self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let milestone = self.milestones.require(milestone_id)?;
            let actor = caller.actor_on(&job);
            let now = Utc::now();

            if !self
                .disputes
                .filter(|d| d.milestone_id == milestone_id && d.status.is_open())
                .is_empty()
            {
                return Err(Rejection::invalid(
                    EntityKind::Milestone,
                    milestone.status,
                    "dispute",
                    "milestone already has an open dispute",
                )
                .into());
            }

            let dispute = Dispute::raise(&job, &milestone, &actor, reason, now)?;
            let mut staged = Staged::default();
            self.stage_milestone(&job, &milestone, MilestoneAction::Dispute, &actor, &mut staged)?;

            if let Some(batch) = milestone.pending_batch {
                match self.escrow.ensure_unsettled(&batch) {
                    Ok(()) => {}
                    Err(EscrowError::AlreadySettled { .. }) => {
                        return Err(Rejection::invalid(
                            EntityKind::Milestone,
                            milestone.status,
                            "dispute",
                            "funds for this milestone have already been released",
                        )
                        .into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            tracing::info!(dispute_id = %dispute.id, milestone_id = %milestone_id, raised_by = %actor, "dispute raised");
            let created = dispute.clone();
            staged.insert(dispute);
            let mut committed = self.commit(staged)?;

            if let Some(batch) = milestone.pending_batch {
                if let Err(e) = self.abandon_in_flight(&job, milestone_id, batch, &mut committed) {
                    tracing::error!(milestone_id = %milestone_id, batch_id = %batch, error = %e, "could not abandon in-flight settlement");
                }
            }
            Ok((created, committed))
        });
        let (dispute, committed) = self.observe("dispute", "raise", result)?;
        self.finish(committed).await;
        Ok(dispute)
    }

    /// Abandon the batch a newly disputed milestone let go of. Funds that
    /// already moved on it stall the milestone. Caller holds the job lock.
    fn abandon_in_flight(
        &self,
        job: &Job,
        milestone_id: MilestoneId,
        batch: BatchId,
        committed: &mut Committed,
    ) -> Result<(), AppError> {
        let abandoned = self.escrow.abandon_batch(&batch)?;
        tracing::info!(milestone_id = %milestone_id, batch_id = %batch, voided = abandoned.voided, "in-flight settlement voided by dispute");
        if abandoned.orphaned == 0 {
            return Ok(());
        }
        let disputed = self.milestones.require(milestone_id)?;
        let (next, event) = disputed.flag_batch_stalled(
            job,
            Some(batch),
            "funds moved on an abandoned settlement batch",
            Utc::now(),
        );
        let mut staged = Staged::default();
        staged.event(event);
        staged.update(disputed.version, next);
        committed.absorb(self.commit(staged)?);
        Ok(())
    }

    /// Arbiter takes ownership of a pending dispute.
    pub async fn claim_dispute(
        &self,
        caller: &CallerIdentity,
        dispute_id: DisputeId,
    ) -> Result<Dispute, AppError> {
        self.dispute_action(caller, dispute_id, "claim", |dispute, _, actor, staged| {
            let next = dispute.claim(actor, Utc::now())?;
            staged.update(dispute.version, next);
            Ok(())
        })
        .await
    }

    /// Arbiter rules on a dispute. The ruling's settlement is dispatched
    /// once committed; the milestone completes when it confirms.
    pub async fn resolve_dispute(
        &self,
        caller: &CallerIdentity,
        dispute_id: DisputeId,
        action: ResolutionAction,
        note: String,
    ) -> Result<Dispute, AppError> {
        self.dispute_action(caller, dispute_id, "resolve", |dispute, job, actor, staged| {
            let now = Utc::now();
            let milestone = self.milestones.require(dispute.milestone_id)?;
            let outcome = dispute.resolve(job, actor, action, note, &self.escrow.fees(), now)?;
            let next = milestone
                .mark_resolved(actor, now)?
                .attach_settlement(outcome.plan.batch_id, outcome.plan.revert_to);
            staged.update(dispute.version, outcome.dispute);
            staged.update(milestone.version, next);
            staged.event(outcome.event);
            staged.plan(outcome.plan);
            staged.resync(job.parties());
            Ok(())
        })
        .await
    }

    /// Arbiter closes a dispute without a ruling.
    pub async fn dismiss_dispute(
        &self,
        caller: &CallerIdentity,
        dispute_id: DisputeId,
        reason: String,
    ) -> Result<Dispute, AppError> {
        self.dispute_action(caller, dispute_id, "dismiss", |dispute, job, actor, staged| {
            let now = Utc::now();
            let milestone = self.milestones.require(dispute.milestone_id)?;
            let (closed, event) = dispute.dismiss(job, actor, reason, now)?;
            let mut restored = milestone.restore_after_dismissal(actor, now)?;

            // A dispute raised after approval voided the release; re-plan it.
            if restored.status == MilestoneStatus::Approved {
                let freelancer = job.freelancer.ok_or_else(|| {
                    AppError::Internal(format!("job {} has no freelancer to release to", job.id))
                })?;
                let intent = Intent::release(job.id, milestone.id, milestone.amount, job.client, freelancer)
                    .reverting_to(MilestoneStatus::Submitted);
                let plan = self.escrow.plan(&intent)?;
                restored = restored.attach_settlement(plan.batch_id, plan.revert_to);
                staged.plan(plan);
            }

            staged.update(dispute.version, closed);
            staged.update(milestone.version, restored);
            staged.event(event);
            Ok(())
        })
        .await
    }

    async fn dispute_action(
        &self,
        caller: &CallerIdentity,
        dispute_id: DisputeId,
        action: &str,
        stage: impl FnOnce(&Dispute, &gig_state::Job, &gig_core::Actor, &mut Staged) -> Result<(), AppError>,
    ) -> Result<Dispute, AppError> {
        let job_id = self.disputes.require(dispute_id)?.job_id;
        let result = self.locked(job_id, || {
            let dispute = self.disputes.require(dispute_id)?;
            let job = self.jobs.require(job_id)?;
            let actor = caller.actor_on(&job);
            let mut staged = Staged::default();
            stage(&dispute, &job, &actor, &mut staged)?;
            self.commit(staged)
        });
        let committed = self.observe("dispute", action, result)?;
        self.finish(committed).await;
        Ok(self.disputes.require(dispute_id)?)
    }

    // -- Queries ---------------------------------------------------------------

    pub fn dispute(&self, dispute_id: DisputeId) -> Result<Dispute, AppError> {
        Ok(self.disputes.require(dispute_id)?)
    }

    /// Disputes oldest first, optionally only those still open.
    pub fn list_disputes(&self, open_only: bool) -> Vec<Dispute> {
        let mut disputes = self.disputes.filter(|d| !open_only || d.status.is_open());
        disputes.sort_by_key(|d| d.created_at);
        disputes
    }

    /// Open disputes older than the configured SLA.
    pub fn overdue_disputes(&self, now: DateTime<Utc>) -> Vec<Dispute> {
        let all = self.disputes.list();
        gig_arbitration::overdue(&all, now, self.config.dispute_sla)
            .into_iter()
            .cloned()
            .collect()
    }
}
