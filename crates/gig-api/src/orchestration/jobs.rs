//! Job and bid operations.

use chrono::Utc;
use gig_core::{Actor, BidId, JobId, Rejection};
use gig_state::{
    transition_job, Bid, Job, JobAction, JobContext, Milestone, NewBid, NewJob, NewMilestone,
};

use super::{read_version, Committed, Marketplace, Staged};
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::records::JobFilter;
use crate::state::expect_version;

impl Marketplace {
    /// Post a new job owned by the caller.
    pub async fn create_job(&self, caller: &CallerIdentity, input: NewJob) -> Result<Job, AppError> {
        let client = caller.require_member("post job")?;
        let job = self.observe("job", "create", Job::create(client, input, Utc::now()).map_err(AppError::from))?;
        let committed = self.locked(job.id, || {
            let mut staged = Staged::default();
            staged.insert(job.clone());
            self.commit(staged)
        })?;
        tracing::info!(job_id = %job.id, client = %client, "job posted");
        self.finish(committed).await;
        Ok(job)
    }

    /// Client adds a milestone to an open or running job.
    pub async fn add_milestone(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        input: NewMilestone,
    ) -> Result<Milestone, AppError> {
        let result = self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let existing = self.milestones.filter(|m| m.job_id == job_id);
            let milestone = Milestone::create(&job, &existing, &caller.actor_on(&job), input, Utc::now())?;
            let mut staged = Staged::default();
            staged.insert(milestone.clone());
            Ok((self.commit(staged)?, milestone))
        });
        let (committed, milestone) = self.observe("milestone", "create", result)?;
        self.finish(committed).await;
        Ok(milestone)
    }

    // -- Bids ------------------------------------------------------------------

    /// Freelancer bids on an open job.
    pub async fn place_bid(&self, caller: &CallerIdentity, job_id: JobId, input: NewBid) -> Result<Bid, AppError> {
        let freelancer = caller.require_member("place bid")?;
        let result = self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let existing = self.bids.filter(|b| b.job_id == job_id);
            let (bid, event) = Bid::place(&job, &existing, freelancer, input, Utc::now())?;
            let mut staged = Staged::default();
            staged.insert(bid.clone());
            staged.event(event);
            Ok((self.commit(staged)?, bid))
        });
        let (committed, bid) = self.observe("bid", "place", result)?;
        self.finish(committed).await;
        Ok(bid)
    }

    pub async fn shortlist_bid(&self, caller: &CallerIdentity, bid_id: BidId) -> Result<Bid, AppError> {
        self.bid_action(caller, bid_id, "shortlist", |bid, job, caller| {
            bid.shortlist(job, &caller.actor_on(job), Utc::now())
        })
        .await
    }

    pub async fn decline_bid(&self, caller: &CallerIdentity, bid_id: BidId) -> Result<Bid, AppError> {
        self.bid_action(caller, bid_id, "decline", |bid, job, caller| {
            bid.decline(job, &caller.actor_on(job), Utc::now())
        })
        .await
    }

    pub async fn withdraw_bid(&self, caller: &CallerIdentity, bid_id: BidId) -> Result<Bid, AppError> {
        self.bid_action(caller, bid_id, "withdraw", |bid, job, caller| {
            bid.withdraw(&caller.actor_on(job), Utc::now())
        })
        .await
    }

    async fn bid_action(
        &self,
        caller: &CallerIdentity,
        bid_id: BidId,
        action: &str,
        apply: impl FnOnce(&Bid, &Job, &CallerIdentity) -> Result<Bid, Rejection>,
    ) -> Result<Bid, AppError> {
        let job_id = self.bids.require(bid_id)?.job_id;
        let result = self.locked(job_id, || {
            let bid = self.bids.require(bid_id)?;
            let job = self.jobs.require(job_id)?;
            let next = apply(&bid, &job, caller)?;
            let mut staged = Staged::default();
            staged.update(bid.version, next.clone());
            Ok((self.commit(staged)?, next))
        });
        let (committed, bid) = self.observe("bid", action, result)?;
        self.finish(committed).await;
        Ok(bid)
    }

    // -- Job transitions -------------------------------------------------------

    /// Client accepts a bid, assigning the job and rejecting every other bid.
    pub async fn accept_bid(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        bid_id: BidId,
        expected_version: Option<u64>,
    ) -> Result<Job, AppError> {
        self.job_action(caller, job_id, JobAction::Assign { bid_id }, expected_version)
            .await
    }

    pub async fn start_job(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        expected_version: Option<u64>,
    ) -> Result<Job, AppError> {
        self.job_action(caller, job_id, JobAction::Start, expected_version)
            .await
    }

    /// Close out a job whose live milestones have all completed.
    pub async fn complete_job(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        expected_version: Option<u64>,
    ) -> Result<Job, AppError> {
        self.job_action(caller, job_id, JobAction::Complete, expected_version)
            .await
    }

    /// Cancel a job, refunding every milestone that holds escrow.
    pub async fn cancel_job(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        reason: String,
        expected_version: Option<u64>,
    ) -> Result<Job, AppError> {
        self.job_action(caller, job_id, JobAction::Cancel { reason }, expected_version)
            .await
    }

    async fn job_action(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        action: JobAction,
        expected_version: Option<u64>,
    ) -> Result<Job, AppError> {
        let name = action.name();
        let arrived = self.jobs.require(job_id)?.version;
        let result = self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            expect_version(&job, expected_version.or(Some(arrived)))?;
            self.stage_job_action(&job, action, &caller.actor_on(&job))
        });
        let committed = self.observe("job", name, result)?;
        self.finish(committed).await;
        Ok(self.jobs.require(job_id)?)
    }

    /// Apply a job transition and stage its cascades. Caller holds the lock.
    pub(crate) fn stage_job_action(
        &self,
        job: &Job,
        action: JobAction,
        actor: &Actor,
    ) -> Result<Committed, AppError> {
        let bids = self.bids.filter(|b| b.job_id == job.id);
        let milestones = self.milestones.filter(|m| m.job_id == job.id);
        let cancelling = matches!(action, JobAction::Cancel { .. });
        let completing = matches!(action, JobAction::Complete);
        let t = transition_job(
            job,
            action,
            actor,
            &JobContext {
                bids: &bids,
                milestones: &milestones,
                fund_window: self.config.fund_window,
                now: Utc::now(),
            },
        )?;

        let mut staged = Staged::default();
        for bid in t.bids {
            staged.update(read_version(&bids, &bid)?, bid);
        }

        let mut changed = t.milestones;
        for intent in &t.intents {
            let plan = self.escrow.plan(intent)?;
            if let Some(m) = changed.iter_mut().find(|m| m.id == intent.milestone_id) {
                *m = m.attach_settlement(plan.batch_id, plan.revert_to);
            }
            tracing::info!(
                job_id = %job.id,
                milestone_id = %intent.milestone_id,
                batch_id = %plan.batch_id,
                kind = %intent.kind,
                "settlement planned"
            );
            staged.plan(plan);
        }
        for m in changed {
            staged.update(read_version(&milestones, &m)?, m);
        }

        if cancelling || completing {
            staged.resync(job.parties());
        }
        tracing::info!(job_id = %job.id, from = %job.status, to = %t.job.status, "job transition");
        staged.events(t.events);
        staged.update(job.version, t.job);
        self.commit(staged)
    }

    // -- Queries ---------------------------------------------------------------

    pub fn job(&self, job_id: JobId) -> Result<Job, AppError> {
        Ok(self.jobs.require(job_id)?)
    }

    /// Jobs matching `filter`, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs = self.jobs.filter(|j| filter.matches(j));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn bid(&self, bid_id: BidId) -> Result<Bid, AppError> {
        Ok(self.bids.require(bid_id)?)
    }

    /// Bids on a job, oldest first.
    pub fn bids_for(&self, job_id: JobId) -> Result<Vec<Bid>, AppError> {
        self.jobs.require(job_id)?;
        let mut bids = self.bids.filter(|b| b.job_id == job_id);
        bids.sort_by_key(|b| b.created_at);
        Ok(bids)
    }

    /// Milestones of a job, in creation order.
    pub fn milestones_for(&self, job_id: JobId) -> Result<Vec<Milestone>, AppError> {
        self.jobs.require(job_id)?;
        let mut milestones = self.milestones.filter(|m| m.job_id == job_id);
        milestones.sort_by_key(|m| m.created_at);
        Ok(milestones)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use gig_core::{EventKind, RejectionCode};
    use gig_state::{BidStatus, BudgetBounds, JobStatus, MilestoneStatus};

    fn new_job() -> NewJob {
        NewJob {
            title: "Landing page".into(),
            description: "Responsive marketing page".into(),
            category: "web".into(),
            budget: BudgetBounds::new(Harness::major(500), Harness::major(1500)).unwrap(),
            currency: "USD".into(),
            bidding_closes_at: None,
        }
    }

    fn new_bid(amount: i64) -> NewBid {
        NewBid {
            amount: Harness::major(amount),
            delivery_days: 10,
            cover_note: "Happy to help".into(),
        }
    }

    fn rejection_code(err: AppError) -> RejectionCode {
        match err {
            AppError::Rejected(r) => r.code(),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepting_a_bid_rejects_siblings_and_sets_deadline() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let winner = h.market.place_bid(&h.freelancer(), job.id, new_bid(1000)).await.unwrap();
        let other = CallerIdentity::member(gig_core::UserId::new());
        let loser = h.market.place_bid(&other, job.id, new_bid(900)).await.unwrap();

        let assigned = h
            .market
            .accept_bid(&h.client(), job.id, winner.id, Some(job.version))
            .await
            .unwrap();
        assert_eq!(assigned.status, JobStatus::Assigned);
        assert_eq!(assigned.freelancer, Some(h.freelancer));
        assert!(assigned.fund_deadline.is_some());
        assert_eq!(h.market.bid(winner.id).unwrap().status, BidStatus::Accepted);
        assert_eq!(h.market.bid(loser.id).unwrap().status, BidStatus::Rejected);
        assert_eq!(h.events.count(EventKind::JobAssigned), 1);
        assert_eq!(h.market.metrics().transitions("job", "assign", "ok"), 1);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let bid = h.market.place_bid(&h.freelancer(), job.id, new_bid(1000)).await.unwrap();
        let err = h
            .market
            .accept_bid(&h.client(), job.id, bid.id, Some(job.version + 7))
            .await
            .unwrap_err();
        assert_eq!(rejection_code(err), RejectionCode::Conflict);
        assert_eq!(h.market.metrics().transitions("job", "assign", "CONFLICT"), 1);
    }

    #[tokio::test]
    async fn freelancer_cannot_accept_own_bid() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let bid = h.market.place_bid(&h.freelancer(), job.id, new_bid(1000)).await.unwrap();
        let err = h
            .market
            .accept_bid(&h.freelancer(), job.id, bid.id, None)
            .await
            .unwrap_err();
        assert_eq!(rejection_code(err), RejectionCode::Forbidden);
    }

    #[tokio::test]
    async fn withdrawn_bid_cannot_be_accepted() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let bid = h.market.place_bid(&h.freelancer(), job.id, new_bid(1000)).await.unwrap();
        h.market.shortlist_bid(&h.client(), bid.id).await.unwrap();
        let withdrawn = h.market.withdraw_bid(&h.freelancer(), bid.id).await.unwrap();
        assert_eq!(withdrawn.status, BidStatus::Withdrawn);
        let err = h.market.accept_bid(&h.client(), job.id, bid.id, None).await.unwrap_err();
        assert_eq!(rejection_code(err), RejectionCode::InvalidTransition);
    }

    #[tokio::test]
    async fn cancelling_a_funded_job_refunds_escrow() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let bid = h.market.place_bid(&h.freelancer(), job.id, new_bid(1000)).await.unwrap();
        h.market.accept_bid(&h.client(), job.id, bid.id, None).await.unwrap();
        let m = h
            .market
            .add_milestone(
                &h.client(),
                job.id,
                NewMilestone {
                    title: "Design".into(),
                    description: "Mockups".into(),
                    amount: Harness::major(400),
                    fund_by: None,
                },
            )
            .await
            .unwrap();
        h.market.fund_milestone(&h.client(), m.id, None).await.unwrap();

        let cancelled = h
            .market
            .cancel_job(&h.client(), job.id, "changed plans".into(), None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.freelancer, None);
        let m = h.market.milestones().get(m.id).unwrap();
        assert_eq!(m.status, MilestoneStatus::Cancelled);
        assert_eq!(m.pending_batch, None);
        assert_eq!(
            h.gateway.credited(gig_escrow::Party::Client(h.client)),
            Harness::major(400)
        );
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let h = Harness::new();
        let a = h.market.create_job(&h.client(), new_job()).await.unwrap();
        let b = h.market.create_job(&h.client(), new_job()).await.unwrap();
        h.market.cancel_job(&h.client(), b.id, "dup".into(), None).await.unwrap();

        let open = h.market.list_jobs(&JobFilter {
            status: Some(JobStatus::Open),
            ..JobFilter::default()
        });
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, a.id);
        assert_eq!(h.market.list_jobs(&JobFilter::default()).len(), 2);
    }
}
