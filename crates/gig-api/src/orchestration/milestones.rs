//! Milestone operations: fund, start, submit, approve and reject.
//!
//! Approval and funding carry money. Their settlement plan is journaled in
//! the same commit as the transition and dispatched afterwards; the
//! milestone holds `pending_batch` until the outcome is folded back in.

use chrono::Utc;
use gig_core::{Actor, MilestoneId};
use gig_state::{
    transition_job, transition_milestone, DeliveryPackage, DeliveryStatus, FileEntry, Job, JobAction,
    JobContext, JobStatus, Milestone, MilestoneAction, MilestoneContext,
};

use super::{Marketplace, Staged};
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::state::expect_version;

/// Work handed in for a milestone: either a manifest of files, which
/// becomes a delivery package, or a bare artifact reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub reference: Option<String>,
    pub files: Vec<FileEntry>,
    pub note: String,
}

impl Marketplace {
    /// Client deposits the milestone amount into escrow.
    pub async fn fund_milestone(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        expected_version: Option<u64>,
    ) -> Result<Milestone, AppError> {
        self.milestone_action(caller, milestone_id, expected_version, "fund", |job, m, actor, staged| {
            self.stage_milestone(job, m, MilestoneAction::Fund, actor, staged)
                .map(drop)
        })
        .await
    }

    /// Freelancer begins work. The first start on an assigned job also
    /// moves the job to `in_progress`.
    pub async fn start_milestone(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        expected_version: Option<u64>,
    ) -> Result<Milestone, AppError> {
        self.milestone_action(caller, milestone_id, expected_version, "start", |job, m, actor, staged| {
            let mut job = job.clone();
            if job.status == JobStatus::Assigned {
                let bids = self.bids.filter(|b| b.job_id == job.id);
                let milestones = self.milestones.filter(|x| x.job_id == job.id);
                let t = transition_job(
                    &job,
                    JobAction::Start,
                    &Actor::system(),
                    &JobContext {
                        bids: &bids,
                        milestones: &milestones,
                        fund_window: None,
                        now: Utc::now(),
                    },
                )?;
                staged.events(t.events);
                staged.update(job.version, t.job.clone());
                job = t.job;
            }
            self.stage_milestone(&job, m, MilestoneAction::Start, actor, staged)
                .map(drop)
        })
        .await
    }

    /// Freelancer hands in work, optionally as a delivery package.
    pub async fn submit_milestone(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        submission: Submission,
        expected_version: Option<u64>,
    ) -> Result<Milestone, AppError> {
        self.milestone_action(caller, milestone_id, expected_version, "submit", |job, m, actor, staged| {
            let reference = if submission.files.is_empty() {
                submission.reference.unwrap_or_default()
            } else {
                let package =
                    DeliveryPackage::deliver(job, m, actor, submission.files, submission.note, Utc::now())?;
                let reference = package.id.to_string();
                staged.insert(package);
                reference
            };
            self.stage_milestone(job, m, MilestoneAction::Submit { reference }, actor, staged)
                .map(drop)
        })
        .await
    }

    /// Client accepts the submission, releasing the escrowed funds.
    pub async fn approve_milestone(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        note: Option<String>,
        expected_version: Option<u64>,
    ) -> Result<Milestone, AppError> {
        self.milestone_action(caller, milestone_id, expected_version, "approve", |job, m, actor, staged| {
            self.stage_milestone(job, m, MilestoneAction::Approve { note }, actor, staged)?;
            if let Some(package) = self.latest_delivery(m.id) {
                staged.update(package.version, package.accept(job, actor, Utc::now())?);
            }
            Ok(())
        })
        .await
    }

    /// Client sends the submission back with feedback.
    pub async fn reject_milestone(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        feedback: String,
        expected_version: Option<u64>,
    ) -> Result<Milestone, AppError> {
        self.milestone_action(caller, milestone_id, expected_version, "reject", |job, m, actor, staged| {
            self.stage_milestone(job, m, MilestoneAction::Reject { feedback }, actor, staged)?;
            if let Some(package) = self.latest_delivery(m.id) {
                staged.update(package.version, package.reject(job, actor, Utc::now())?);
            }
            Ok(())
        })
        .await
    }

    async fn milestone_action(
        &self,
        caller: &CallerIdentity,
        milestone_id: MilestoneId,
        expected_version: Option<u64>,
        action: &str,
        stage: impl FnOnce(&Job, &Milestone, &Actor, &mut Staged) -> Result<(), AppError>,
    ) -> Result<Milestone, AppError> {
        let arrived = self.milestones.require(milestone_id)?;
        let job_id = arrived.job_id;
        let result = self.locked(job_id, || {
            let milestone = self.milestones.require(milestone_id)?;
            // Without an explicit version the caller expects the state it arrived at.
            expect_version(&milestone, expected_version.or(Some(arrived.version)))?;
            let job = self.jobs.require(job_id)?;
            let actor = caller.actor_on(&job);
            let mut staged = Staged::default();
            stage(&job, &milestone, &actor, &mut staged)?;
            self.commit(staged)
        });
        let committed = self.observe("milestone", action, result)?;
        self.finish(committed).await;
        Ok(self.milestones.require(milestone_id)?)
    }

    /// Run a milestone transition and stage the result, planning any
    /// settlement it requires. Caller holds the job lock.
    pub(crate) fn stage_milestone(
        &self,
        job: &Job,
        milestone: &Milestone,
        action: MilestoneAction,
        actor: &Actor,
        staged: &mut Staged,
    ) -> Result<Milestone, AppError> {
        let name = action.name();
        let dispute_open = !self
            .disputes
            .filter(|d| d.milestone_id == milestone.id && d.status.is_open())
            .is_empty();
        let t = transition_milestone(
            milestone,
            action,
            actor,
            &MilestoneContext {
                job,
                policy: &self.config.policy,
                dispute_open,
                now: Utc::now(),
            },
        )?;
        let mut next = t.milestone;
        for intent in &t.intents {
            let plan = self.escrow.plan(intent)?;
            next = next.attach_settlement(plan.batch_id, plan.revert_to);
            tracing::info!(
                milestone_id = %milestone.id,
                batch_id = %plan.batch_id,
                kind = %intent.kind,
                amount = %intent.amount,
                "settlement planned"
            );
            staged.plan(plan);
        }
        tracing::debug!(milestone_id = %milestone.id, action = name, from = %milestone.status, to = %next.status, "milestone transition");
        staged.events(t.events);
        staged.update(milestone.version, next.clone());
        Ok(next)
    }

    fn latest_delivery(&self, milestone_id: MilestoneId) -> Option<DeliveryPackage> {
        self.deliveries
            .filter(|d| d.milestone_id == milestone_id && d.status == DeliveryStatus::Delivered)
            .into_iter()
            .max_by_key(|d| d.delivered_at)
    }

    // -- Queries ---------------------------------------------------------------

    pub fn milestone(&self, milestone_id: MilestoneId) -> Result<Milestone, AppError> {
        Ok(self.milestones.require(milestone_id)?)
    }

    /// Delivery packages of a milestone, oldest first.
    pub fn deliveries_for(&self, milestone_id: MilestoneId) -> Result<Vec<DeliveryPackage>, AppError> {
        self.milestones.require(milestone_id)?;
        let mut packages = self.deliveries.filter(|d| d.milestone_id == milestone_id);
        packages.sort_by_key(|d| d.delivered_at);
        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use gig_core::{EventKind, RejectionCode};
    use gig_escrow::{MockOutcome, Party};
    use gig_state::MilestoneStatus;

    fn code(err: AppError) -> RejectionCode {
        match err {
            AppError::Rejected(r) => r.code(),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn approval_releases_funds_and_completes_the_job() {
        let h = Harness::new();
        let (job, ms) = h.assigned_job(&[1000]).await;
        h.submitted(ms[0].id).await;
        assert_eq!(h.market.job(job.id).unwrap().status, JobStatus::InProgress);

        let m = h
            .market
            .approve_milestone(&h.client(), ms[0].id, Some("great".into()), None)
            .await
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::Completed);
        assert_eq!(m.pending_batch, None);
        assert_eq!(h.gateway.credited(Party::Freelancer(h.freelancer)), Harness::major(1000));

        let job = h.market.job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.events.count(EventKind::JobCompleted), 1);
        let invoices = h.market.invoices_for(job.id).unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].net_to_freelancer, Harness::major(1000));
    }

    #[test]
    fn unversioned_approvals_queued_on_the_lock_yield_one_conflict() {
        let runtime = || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
        };
        let h = Harness::new();
        let (job, ms) = runtime().block_on(async {
            let (job, ms) = h.assigned_job(&[600]).await;
            h.submitted(ms[0].id).await;
            (job, ms)
        });

        let lock = h.market.lock_for(job.id);
        let guard = lock.lock();
        let results: Vec<_> = std::thread::scope(|scope| {
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        runtime().block_on(h.market.approve_milestone(&h.client(), ms[0].id, None, None))
                    })
                })
                .collect();
            // The map, this test and both racers hold the lock handle once
            // each racer has read the milestone and is waiting.
            while std::sync::Arc::strong_count(&lock) < 4 {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            drop(guard);
            racers.into_iter().map(|r| r.join().unwrap()).collect()
        });

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].status, MilestoneStatus::Completed);
        let loser = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(code(loser), RejectionCode::Conflict);
        assert_eq!(h.gateway.credited(Party::Freelancer(h.freelancer)), Harness::major(600));
    }

    #[tokio::test]
    async fn permanent_release_failure_reverts_to_submitted() {
        let h = Harness::new();
        let (_, ms) = h.assigned_job(&[300]).await;
        h.submitted(ms[0].id).await;

        h.gateway.script([MockOutcome::Permanent]);
        let m = h
            .market
            .approve_milestone(&h.client(), ms[0].id, None, None)
            .await
            .unwrap();
        assert_eq!(m.status, MilestoneStatus::Submitted);
        assert_eq!(m.pending_batch, None);
        assert_eq!(h.events.count(EventKind::SettlementFailed), 1);
        assert_eq!(h.gateway.credited(Party::Freelancer(h.freelancer)), gig_core::Amount::ZERO);
    }

    #[tokio::test]
    async fn start_before_funding_confirmation_is_refused() {
        let h = Harness::new();
        let (_, ms) = h.assigned_job(&[300]).await;
        h.gateway.script([MockOutcome::Accept]);
        let funded = h.market.fund_milestone(&h.client(), ms[0].id, None).await.unwrap();
        assert_eq!(funded.status, MilestoneStatus::Funded);
        assert!(funded.pending_batch.is_some());

        let err = h
            .market
            .start_milestone(&h.freelancer(), ms[0].id, None)
            .await
            .unwrap_err();
        assert_eq!(code(err), RejectionCode::InvalidTransition);
    }

    #[tokio::test]
    async fn delivery_package_follows_the_review() {
        let h = Harness::new();
        let (_, ms) = h.assigned_job(&[500]).await;
        h.market.fund_milestone(&h.client(), ms[0].id, None).await.unwrap();
        h.market.start_milestone(&h.freelancer(), ms[0].id, None).await.unwrap();
        let submitted = h
            .market
            .submit_milestone(
                &h.freelancer(),
                ms[0].id,
                Submission {
                    reference: None,
                    files: vec![FileEntry {
                        name: "design.fig".into(),
                        content_ref: "s3://bucket/design.fig".into(),
                        size_bytes: 2048,
                        sha256: None,
                    }],
                    note: "first pass".into(),
                },
                None,
            )
            .await
            .unwrap();
        let packages = h.market.deliveries_for(ms[0].id).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(submitted.submission_ref, Some(packages[0].id.to_string()));

        h.market
            .reject_milestone(&h.client(), ms[0].id, "needs dark mode".into(), None)
            .await
            .unwrap();
        let packages = h.market.deliveries_for(ms[0].id).unwrap();
        assert_eq!(packages[0].status, DeliveryStatus::Rejected);
    }

    #[tokio::test]
    async fn rejection_limit_forces_a_dispute() {
        let mut h = Harness::new();
        h.market.config.policy.max_rejections = Some(1);
        let (_, ms) = h.assigned_job(&[200]).await;
        h.submitted(ms[0].id).await;
        h.market
            .reject_milestone(&h.client(), ms[0].id, "try again".into(), None)
            .await
            .unwrap();
        h.market
            .submit_milestone(
                &h.freelancer(),
                ms[0].id,
                Submission {
                    reference: Some("v2".into()),
                    ..Submission::default()
                },
                None,
            )
            .await
            .unwrap();
        let err = h
            .market
            .reject_milestone(&h.client(), ms[0].id, "still no".into(), None)
            .await
            .unwrap_err();
        assert_eq!(code(err), RejectionCode::InvalidTransition);
    }

    #[tokio::test]
    async fn freelancer_cannot_fund() {
        let h = Harness::new();
        let (_, ms) = h.assigned_job(&[200]).await;
        let err = h
            .market
            .fund_milestone(&h.freelancer(), ms[0].id, None)
            .await
            .unwrap_err();
        assert_eq!(code(err), RejectionCode::Forbidden);
        assert_eq!(h.market.metrics().transitions("milestone", "fund", "FORBIDDEN"), 1);
    }
}
