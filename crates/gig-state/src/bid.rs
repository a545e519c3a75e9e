//! # Bids
//!
//! A freelancer places at most one bid per job. Acceptance happens through
//! [`JobAction::Assign`](crate::job::JobAction::Assign), which is the only
//! path to [`BidStatus::Accepted`]; the functions here cover the rest of the
//! bid sub-lifecycle.
//!
//! ```text
//!   Pending ──shortlist──▶ Shortlisted
//!      │                       │
//!      ├── withdraw ───────────┼──▶ Withdrawn
//!      ├── decline ────────────┼──▶ Rejected
//!      └── (job assign) ───────┴──▶ Accepted | Rejected
//! ```

use chrono::{DateTime, Utc};
use gig_core::{
    Actor, Amount, BidId, DomainEvent, EntityKind, EventKind, JobId, Rejection, Role, UserId,
};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Lifecycle state of a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Shortlisted,
    Accepted,
    Rejected,
    Withdrawn,
}

impl BidStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Shortlisted => "shortlisted",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Withdrawn => "withdrawn",
        }
    }

    /// Still under consideration by the client.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Shortlisted)
    }
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for [`Bid::place`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBid {
    pub amount: Amount,
    pub delivery_days: u32,
    pub cover_note: String,
}

/// A freelancer's offer on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub job_id: JobId,
    pub freelancer: UserId,
    pub amount: Amount,
    pub delivery_days: u32,
    pub cover_note: String,
    pub status: BidStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bid {
    /// Place a bid by `freelancer` on `job`.
    ///
    /// `existing` must contain every bid already on the job.
    pub fn place(
        job: &Job,
        existing: &[Bid],
        freelancer: UserId,
        input: NewBid,
        now: DateTime<Utc>,
    ) -> Result<(Bid, DomainEvent), Rejection> {
        if freelancer == job.client {
            return Err(Rejection::forbidden("bid on own job", Role::Client));
        }
        if job.status != JobStatus::Open {
            return Err(Rejection::invalid(
                EntityKind::Job,
                job.status,
                "place bid",
                "job is not accepting bids",
            ));
        }
        if job.bidding_closes_at.is_some_and(|closes| now >= closes) {
            return Err(Rejection::invalid(
                EntityKind::Job,
                job.status,
                "place bid",
                "bidding window has closed",
            ));
        }
        if existing
            .iter()
            .any(|b| b.job_id == job.id && b.freelancer == freelancer)
        {
            return Err(Rejection::validation(
                "freelancer already has a bid on this job",
            ));
        }
        if !job.budget.contains(input.amount) {
            return Err(Rejection::validation(format!(
                "bid amount {} is outside the budget {}..={}",
                input.amount, job.budget.min, job.budget.max
            )));
        }
        if input.delivery_days == 0 {
            return Err(Rejection::validation("delivery estimate must be at least one day"));
        }

        let bid = Bid {
            id: BidId::new(),
            job_id: job.id,
            freelancer,
            amount: input.amount,
            delivery_days: input.delivery_days,
            cover_note: input.cover_note,
            status: BidStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let event = DomainEvent::new(EventKind::BidPlaced, bid.id, now, vec![job.client])
            .for_job(job.id)
            .with_payload(serde_json::json!({ "amount": bid.amount }));
        Ok((bid, event))
    }

    /// Client marks the bid for closer consideration.
    pub fn shortlist(&self, job: &Job, actor: &Actor, now: DateTime<Utc>) -> Result<Bid, Rejection> {
        self.require_client(job, actor, "shortlist bid")?;
        self.require_job_open(job, "shortlist")?;
        if self.status != BidStatus::Pending {
            return Err(Rejection::invalid(
                EntityKind::Bid,
                self.status,
                "shortlist",
                "only pending bids can be shortlisted",
            ));
        }
        Ok(self.with_status(BidStatus::Shortlisted, now))
    }

    /// Client declines the bid outright.
    pub fn decline(&self, job: &Job, actor: &Actor, now: DateTime<Utc>) -> Result<Bid, Rejection> {
        self.require_client(job, actor, "decline bid")?;
        self.require_job_open(job, "decline")?;
        if !self.status.is_live() {
            return Err(Rejection::invalid(
                EntityKind::Bid,
                self.status,
                "decline",
                "bid is no longer under consideration",
            ));
        }
        Ok(self.with_status(BidStatus::Rejected, now))
    }

    /// The bidding freelancer retracts the bid.
    pub fn withdraw(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Bid, Rejection> {
        if actor.user_id != Some(self.freelancer) {
            return Err(Rejection::forbidden("withdraw another freelancer's bid", actor.role));
        }
        if !self.status.is_live() {
            return Err(Rejection::invalid(
                EntityKind::Bid,
                self.status,
                "withdraw",
                "bid is no longer under consideration",
            ));
        }
        Ok(self.with_status(BidStatus::Withdrawn, now))
    }

    /// Copy with a new status and bumped version.
    pub(crate) fn with_status(&self, status: BidStatus, now: DateTime<Utc>) -> Bid {
        let mut next = self.clone();
        next.status = status;
        next.version += 1;
        next.updated_at = now;
        next
    }

    fn require_client(&self, job: &Job, actor: &Actor, action: &str) -> Result<(), Rejection> {
        if actor.role != Role::Client || actor.user_id != Some(job.client) {
            return Err(Rejection::forbidden(action, actor.role));
        }
        Ok(())
    }

    fn require_job_open(&self, job: &Job, action: &str) -> Result<(), Rejection> {
        if job.status != JobStatus::Open {
            return Err(Rejection::invalid(
                EntityKind::Job,
                job.status,
                action,
                "job is no longer accepting bids",
            ));
        }
        Ok(())
    }
}
