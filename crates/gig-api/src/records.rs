//! # Marketplace Records
//!
//! Documents owned by the API layer rather than the state machine: reviews,
//! invoices, and the typed job filter.

use chrono::{DateTime, Utc};
use gig_core::{Amount, EntityKind, InvoiceId, JobId, MilestoneId, Rejection, ReviewId, Role, UserId};
use gig_escrow::{Party, SettlementIntent, SettlementReceipt};
use gig_reputation::ReputationRole;
use gig_state::{Job, JobStatus, Milestone};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Review ──────────────────────────────────────────────────────────────

/// One party's rating of the other after a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub job_id: JobId,
    pub reviewer: UserId,
    pub reviewee: UserId,
    /// Role the reviewee held on the job.
    pub reviewee_role: ReputationRole,
    /// 1..=5 stars.
    pub rating: u8,
    pub comment: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Review {
    /// Rate the counterparty on a completed job. `existing` holds the job's
    /// reviews; each party may review once.
    pub fn submit(
        job: &Job,
        existing: &[Review],
        reviewer: UserId,
        freelancer: UserId,
        rating: u8,
        comment: String,
        now: DateTime<Utc>,
    ) -> Result<Review, Rejection> {
        if job.status != JobStatus::Completed {
            return Err(Rejection::invalid(
                EntityKind::Review,
                job.status,
                "review",
                "only completed jobs can be reviewed",
            ));
        }
        let (reviewee, reviewee_role) = if reviewer == job.client {
            (freelancer, ReputationRole::Freelancer)
        } else if reviewer == freelancer {
            (job.client, ReputationRole::Client)
        } else {
            return Err(Rejection::forbidden("review job", Role::Visitor));
        };
        if !(1..=5).contains(&rating) {
            return Err(Rejection::validation("rating must be between 1 and 5"));
        }
        if existing
            .iter()
            .any(|r| r.job_id == job.id && r.reviewer == reviewer)
        {
            return Err(Rejection::invalid(
                EntityKind::Review,
                "submitted",
                "review",
                "this job was already reviewed by the caller",
            ));
        }
        Ok(Review {
            id: ReviewId::new(),
            job_id: job.id,
            reviewer,
            reviewee,
            reviewee_role,
            rating,
            comment,
            version: 1,
            created_at: now,
        })
    }
}

// ── Invoice ─────────────────────────────────────────────────────────────

/// Immutable statement of how a milestone's escrow was paid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub job_id: JobId,
    pub milestone_id: MilestoneId,
    pub client: UserId,
    pub freelancer: UserId,
    pub gross: Amount,
    pub platform_fee: Amount,
    pub net_to_freelancer: Amount,
    pub refunded_to_client: Amount,
    pub settlement_references: Vec<String>,
    pub version: u64,
    pub issued_at: DateTime<Utc>,
}

impl Invoice {
    /// Build the invoice for a completed milestone from its confirmed legs.
    pub fn issue(
        job: &Job,
        milestone: &Milestone,
        freelancer: UserId,
        legs: &[(SettlementIntent, SettlementReceipt)],
        now: DateTime<Utc>,
    ) -> Result<Invoice, Rejection> {
        let paid = |pred: fn(&Party) -> bool| {
            Amount::sum(legs.iter().filter(|(l, _)| pred(&l.to_party)).map(|(l, _)| l.amount))
        };
        let mut references: Vec<String> = legs
            .iter()
            .map(|(_, r)| r.settlement_reference.clone())
            .collect();
        references.sort();
        Ok(Invoice {
            id: InvoiceId::new(),
            job_id: job.id,
            milestone_id: milestone.id,
            client: job.client,
            freelancer,
            gross: milestone.amount,
            platform_fee: paid(|p| matches!(p, Party::Platform))?,
            net_to_freelancer: paid(|p| matches!(p, Party::Freelancer(_)))?,
            refunded_to_client: paid(|p| matches!(p, Party::Client(_)))?,
            settlement_references: references,
            version: 1,
            issued_at: now,
        })
    }
}

// ── Filters ─────────────────────────────────────────────────────────────

/// Typed job listing filter. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, ToSchema)]
pub struct JobFilter {
    /// `open`, `assigned`, `in_progress`, `completed` or `cancelled`.
    #[schema(value_type = Option<String>)]
    pub status: Option<JobStatus>,
    #[schema(value_type = Option<String>)]
    pub client: Option<UserId>,
    #[schema(value_type = Option<String>)]
    pub freelancer: Option<UserId>,
    pub category: Option<String>,
}

impl JobFilter {
    /// Whether `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.client.map_or(true, |c| job.client == c)
            && self.freelancer.map_or(true, |f| job.freelancer == Some(f))
            && self
                .category
                .as_deref()
                .map_or(true, |c| job.category.eq_ignore_ascii_case(c))
    }
}
