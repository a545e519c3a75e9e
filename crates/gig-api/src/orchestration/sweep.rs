//! Deadline sweep.
//!
//! Candidates are picked from a snapshot and every condition is checked
//! again under the job lock, so overlapping sweeps cancel each entity once.

use chrono::{DateTime, Utc};
use gig_core::{Actor, JobId, MilestoneId};
use gig_state::{Job, JobAction, JobStatus, Milestone, MilestoneStatus};
use serde::Serialize;

use super::{Committed, Marketplace, Staged};
use crate::error::AppError;

/// What one sweep cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cancelled_count: usize,
    pub cancelled_jobs: Vec<JobId>,
    pub cancelled_milestones: Vec<MilestoneId>,
}

fn bidding_expired(job: &Job, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Open && job.bidding_closes_at.is_some_and(|at| at <= now)
}

fn funding_expired(job: &Job, milestones: &[Milestone], now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Assigned
        && job.fund_deadline.is_some_and(|at| at <= now)
        && milestones
            .iter()
            .all(|m| matches!(m.status, MilestoneStatus::Pending | MilestoneStatus::Cancelled))
}

fn milestone_expired(job: &Job, milestone: &Milestone, now: DateTime<Utc>) -> bool {
    job.status.is_active()
        && milestone.status == MilestoneStatus::Pending
        && milestone.fund_by.is_some_and(|at| at <= now)
}

impl Marketplace {
    /// Cancel open jobs whose bidding closed, assigned jobs nobody funded
    /// in time, and pending milestones past their funding date.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for job in self.jobs.list() {
            let milestones = self.milestones.filter(|m| m.job_id == job.id);
            if !bidding_expired(&job, now) && !funding_expired(&job, &milestones, now) {
                continue;
            }
            match self.expire_job(job.id, now) {
                Ok(Some(committed)) => {
                    report.cancelled_jobs.push(job.id);
                    self.finish(committed).await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "sweep could not cancel job"),
            }
        }

        for milestone in self.milestones.filter(|m| m.status == MilestoneStatus::Pending) {
            let Some(job) = self.jobs.get(milestone.job_id) else {
                continue;
            };
            if !milestone_expired(&job, &milestone, now) {
                continue;
            }
            match self.expire_milestone(job.id, milestone.id, now) {
                Ok(Some(committed)) => {
                    report.cancelled_milestones.push(milestone.id);
                    self.finish(committed).await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(milestone_id = %milestone.id, error = %e, "sweep could not cancel milestone"),
            }
        }

        report.cancelled_count = report.cancelled_jobs.len() + report.cancelled_milestones.len();
        if report.cancelled_count > 0 {
            tracing::info!(
                jobs = report.cancelled_jobs.len(),
                milestones = report.cancelled_milestones.len(),
                "expiry sweep cancelled overdue work"
            );
        }
        report
    }

    fn expire_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Committed>, AppError> {
        self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let milestones = self.milestones.filter(|m| m.job_id == job_id);
            let reason = if bidding_expired(&job, now) {
                "bidding closed without an accepted bid"
            } else if funding_expired(&job, &milestones, now) {
                "funding deadline passed"
            } else {
                return Ok(None);
            };
            let committed = self.stage_job_action(
                &job,
                JobAction::Cancel {
                    reason: reason.into(),
                },
                &Actor::system(),
            )?;
            Ok(Some(committed))
        })
    }

    fn expire_milestone(
        &self,
        job_id: JobId,
        milestone_id: MilestoneId,
        now: DateTime<Utc>,
    ) -> Result<Option<Committed>, AppError> {
        self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let milestone = self.milestones.require(milestone_id)?;
            if !milestone_expired(&job, &milestone, now) {
                return Ok(None);
            }
            let next = milestone.cancelled(&Actor::system(), now)?;
            tracing::info!(milestone_id = %milestone_id, job_id = %job_id, "unfunded milestone expired");
            let mut staged = Staged::default();
            staged.update(milestone.version, next);
            self.commit(staged).map(Some)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use chrono::Duration;
    use gig_core::EventKind;
    use gig_state::{BudgetBounds, NewJob, NewMilestone};

    fn new_job(closes: Option<DateTime<Utc>>) -> NewJob {
        NewJob {
            title: "Landing page".into(),
            description: String::new(),
            category: "design".into(),
            budget: BudgetBounds::new(Harness::major(100), Harness::major(900)).unwrap(),
            currency: "USD".into(),
            bidding_closes_at: closes,
        }
    }

    #[tokio::test]
    async fn expired_open_job_is_cancelled_once() {
        let h = Harness::new();
        let job = h
            .market
            .create_job(&h.client(), new_job(Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        let early = h.market.sweep_expired(Utc::now()).await;
        assert_eq!(early.cancelled_count, 0);

        let later = Utc::now() + Duration::hours(2);
        let first = h.market.sweep_expired(later).await;
        assert_eq!(first.cancelled_jobs, vec![job.id]);
        let second = h.market.sweep_expired(later).await;
        assert_eq!(second.cancelled_count, 0);

        assert_eq!(h.market.job(job.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.events.count(EventKind::JobCancelled), 1);
    }

    #[tokio::test]
    async fn unfunded_assignment_lapses_and_frees_the_job() {
        let h = Harness::new();
        let (job, _) = h.assigned_job(&[300]).await;
        let deadline = job.fund_deadline.unwrap();

        let report = h.market.sweep_expired(deadline + Duration::seconds(1)).await;
        assert_eq!(report.cancelled_jobs, vec![job.id]);
        let job = h.market.job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.freelancer, None);
    }

    #[tokio::test]
    async fn funded_assignment_survives_the_deadline() {
        let h = Harness::new();
        let (job, ms) = h.assigned_job(&[300]).await;
        h.market.fund_milestone(&h.client(), ms[0].id, None).await.unwrap();

        let report = h
            .market
            .sweep_expired(job.fund_deadline.unwrap() + Duration::hours(1))
            .await;
        assert_eq!(report.cancelled_count, 0);
        assert_eq!(h.market.job(job.id).unwrap().status, JobStatus::Assigned);
    }

    #[tokio::test]
    async fn pending_milestone_past_fund_by_is_cancelled() {
        let h = Harness::new();
        let job = h.market.create_job(&h.client(), new_job(None)).await.unwrap();
        let bid = h
            .market
            .place_bid(
                &h.freelancer(),
                job.id,
                gig_state::NewBid {
                    amount: Harness::major(350),
                    delivery_days: 10,
                    cover_note: String::new(),
                },
            )
            .await
            .unwrap();
        h.market.accept_bid(&h.client(), job.id, bid.id, None).await.unwrap();

        let fund_by = Utc::now() + Duration::days(1);
        let mut added = Vec::new();
        for (title, amount, fund_by) in [("Build", 300, None), ("Extras", 50, Some(fund_by))] {
            let m = h
                .market
                .add_milestone(
                    &h.client(),
                    job.id,
                    NewMilestone {
                        title: title.into(),
                        description: String::new(),
                        amount: Harness::major(amount),
                        fund_by,
                    },
                )
                .await
                .unwrap();
            added.push(m);
        }
        h.market.fund_milestone(&h.client(), added[0].id, None).await.unwrap();

        let report = h.market.sweep_expired(fund_by + Duration::minutes(1)).await;
        assert_eq!(report.cancelled_milestones, vec![added[1].id]);
        assert!(report.cancelled_jobs.is_empty());
        assert_eq!(h.market.milestone(added[1].id).unwrap().status, MilestoneStatus::Cancelled);
        assert_eq!(h.market.milestone(added[0].id).unwrap().status, MilestoneStatus::Funded);

        let again = h.market.sweep_expired(fund_by + Duration::minutes(2)).await;
        assert_eq!(again.cancelled_count, 0);
    }
}
