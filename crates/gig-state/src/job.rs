//! # Job Lifecycle
//!
//! ```text
//!            assign(bid)          start             complete
//!   Open ───────────────▶ Assigned ─────▶ InProgress ─────────▶ Completed
//!     │                      │                │
//!     └───────── cancel ─────┴──── cancel ────┘──────▶ Cancelled
//! ```
//!
//! ## Security Invariant
//!
//! `freelancer` is `Some` exactly when the status is `Assigned`,
//! `InProgress` or `Completed`. Cancellation clears it; the accepted bid
//! keeps the historical freelancer. [`Job::check_invariants`] is run by the
//! persistence layer before every write so a violating value is never
//! committed.

use chrono::{DateTime, Duration, Utc};
use gig_core::{
    Actor, Amount, BidId, DomainEvent, EntityKind, EventKind, JobId, Rejection, Role, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bid::{Bid, BidStatus};
use crate::intent::Intent;
use crate::log::TransitionRecord;
use crate::milestone::{Milestone, MilestoneStatus};

// ── Job Status ─────────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepting bids.
    Open,
    /// A bid was accepted; milestones can be funded.
    Assigned,
    /// Work has started.
    InProgress,
    /// Every milestone settled (terminal).
    Completed,
    /// Cancelled by a party or the expiry sweep (terminal).
    Cancelled,
}

impl JobStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions exist.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether a job in this status must name a freelancer.
    pub fn requires_freelancer(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::Completed)
    }

    /// Whether milestones of a job in this status may move.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Statuses reachable in one step.
    pub fn valid_transitions(&self) -> Vec<JobStatus> {
        JOB_EDGES
            .iter()
            .filter(|(from, _, _)| from == self)
            .map(|(_, _, to)| *to)
            .collect()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Rejection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Rejection::validation(format!("unknown job status {other:?}"))),
        }
    }
}

// ── Transition Table ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobActionKind {
    Assign,
    Start,
    Complete,
    Cancel,
}

impl JobActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
        }
    }

    fn permitted_roles(&self) -> &'static [Role] {
        match self {
            Self::Assign => &[Role::Client],
            Self::Start => &[Role::Freelancer, Role::System],
            Self::Complete => &[Role::Client, Role::System],
            Self::Cancel => &[Role::Client, Role::Arbiter, Role::System],
        }
    }
}

const JOB_EDGES: &[(JobStatus, JobActionKind, JobStatus)] = &[
    (JobStatus::Open, JobActionKind::Assign, JobStatus::Assigned),
    (JobStatus::Assigned, JobActionKind::Start, JobStatus::InProgress),
    (JobStatus::InProgress, JobActionKind::Complete, JobStatus::Completed),
    (JobStatus::Open, JobActionKind::Cancel, JobStatus::Cancelled),
    (JobStatus::Assigned, JobActionKind::Cancel, JobStatus::Cancelled),
    (JobStatus::InProgress, JobActionKind::Cancel, JobStatus::Cancelled),
];

fn job_edge(from: JobStatus, action: JobActionKind) -> Option<JobStatus> {
    JOB_EDGES
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

// ── Job ────────────────────────────────────────────────────────────────

/// Inclusive bounds a bid amount must fall within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetBounds {
    /// Lowest acceptable bid.
    pub min: Amount,
    /// Highest acceptable bid, and the cap on pre-defined milestones.
    pub max: Amount,
}

impl BudgetBounds {
    /// Validate and build bounds.
    pub fn new(min: Amount, max: Amount) -> Result<Self, Rejection> {
        if max.is_zero() {
            return Err(Rejection::validation("budget maximum must be positive"));
        }
        if min > max {
            return Err(Rejection::validation(format!(
                "budget minimum {min} exceeds maximum {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Whether `amount` lies within the bounds.
    pub fn contains(&self, amount: Amount) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// Input for [`Job::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Category slug.
    pub category: String,
    /// Bid bounds.
    pub budget: BudgetBounds,
    /// ISO 4217 code.
    pub currency: String,
    /// Bidding closes at this instant; the sweep cancels the job if it is
    /// still open afterwards.
    pub bidding_closes_at: Option<DateTime<Utc>>,
}

/// A job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client: UserId,
    pub freelancer: Option<UserId>,
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget: BudgetBounds,
    pub currency: String,
    /// Accepted bid amount; milestone totals are measured against it.
    pub agreed_total: Option<Amount>,
    pub accepted_bid: Option<BidId>,
    pub status: JobStatus,
    /// Compare-and-swap version; bumped by every applied transition.
    pub version: u64,
    pub bidding_closes_at: Option<DateTime<Utc>>,
    /// Set on assignment. If nothing is funded by then the sweep cancels.
    pub fund_deadline: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub transition_log: Vec<TransitionRecord<JobStatus>>,
}

impl Job {
    /// Post a new job for `client`.
    pub fn create(client: UserId, input: NewJob, now: DateTime<Utc>) -> Result<Self, Rejection> {
        if input.title.trim().is_empty() {
            return Err(Rejection::validation("title must not be empty"));
        }
        if input.category.trim().is_empty() {
            return Err(Rejection::validation("category must not be empty"));
        }
        if input.currency.len() != 3 || !input.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(Rejection::validation(format!(
                "currency {:?} is not an ISO 4217 code",
                input.currency
            )));
        }
        BudgetBounds::new(input.budget.min, input.budget.max)?;
        if let Some(closes) = input.bidding_closes_at {
            if closes <= now {
                return Err(Rejection::validation("bidding deadline must be in the future"));
            }
        }

        Ok(Self {
            id: JobId::new(),
            client,
            freelancer: None,
            title: input.title,
            description: input.description,
            category: input.category,
            budget: input.budget,
            currency: input.currency,
            agreed_total: None,
            accepted_bid: None,
            status: JobStatus::Open,
            version: 1,
            bidding_closes_at: input.bidding_closes_at,
            fund_deadline: None,
            cancellation_reason: None,
            created_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            transition_log: Vec::new(),
        })
    }

    /// Resolve the role `user` holds on this job.
    pub fn role_of(&self, user: UserId) -> Role {
        if user == self.client {
            Role::Client
        } else if self.freelancer == Some(user) {
            Role::Freelancer
        } else {
            Role::Visitor
        }
    }

    /// Build an actor for `user` on this job.
    pub fn actor_for(&self, user: UserId) -> Actor {
        Actor {
            user_id: Some(user),
            role: self.role_of(user),
        }
    }

    /// Parties notified about job-level events.
    pub fn parties(&self) -> Vec<UserId> {
        let mut parties = vec![self.client];
        if let Some(f) = self.freelancer {
            parties.push(f);
        }
        parties
    }

    /// Verify the structural invariants of a single job value.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        match (self.status.requires_freelancer(), self.freelancer.is_some()) {
            (true, false) => {
                return Err(InvariantViolation::MissingFreelancer {
                    job_id: self.id,
                    status: self.status,
                })
            }
            (false, true) => {
                return Err(InvariantViolation::UnexpectedFreelancer {
                    job_id: self.id,
                    status: self.status,
                })
            }
            _ => {}
        }
        if self.status.requires_freelancer()
            && (self.accepted_bid.is_none() || self.agreed_total.is_none())
        {
            return Err(InvariantViolation::MissingAgreement { job_id: self.id });
        }
        Ok(())
    }

    fn advanced(
        &self,
        to: JobStatus,
        action: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Job {
        let mut next = self.clone();
        next.transition_log
            .push(TransitionRecord::new(self.status, to, action, *actor, now));
        next.status = to;
        next.version += 1;
        next
    }
}

/// A structural invariant that a value about to be persisted violates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Status requires a freelancer but none is set.
    #[error("job {job_id} is {status} without a freelancer")]
    MissingFreelancer {
        /// Offending job.
        job_id: JobId,
        /// Its status.
        status: JobStatus,
    },
    /// A freelancer is set in a status that forbids one.
    #[error("job {job_id} is {status} but still names a freelancer")]
    UnexpectedFreelancer {
        /// Offending job.
        job_id: JobId,
        /// Its status.
        status: JobStatus,
    },
    /// Assigned without an accepted bid or agreed total.
    #[error("job {job_id} is assigned without an accepted bid")]
    MissingAgreement {
        /// Offending job.
        job_id: JobId,
    },
    /// Completed milestones add up to more than was agreed.
    #[error("job {job_id}: completed milestones total {completed} exceeds agreed {agreed}")]
    OverReleased {
        /// Offending job.
        job_id: JobId,
        /// Sum of completed milestone amounts.
        completed: Amount,
        /// Agreed total.
        agreed: Amount,
    },
    /// Milestone amounts overflow when summed.
    #[error("job {job_id}: milestone total overflows")]
    TotalOverflow {
        /// Offending job.
        job_id: JobId,
    },
    /// More than one accepted bid.
    #[error("job {job_id} has {count} accepted bids")]
    MultipleAcceptedBids {
        /// Offending job.
        job_id: JobId,
        /// How many.
        count: usize,
    },
}

/// Cross-entity check: completed milestone amounts never exceed the agreed
/// total and at most one bid is accepted.
pub fn check_milestone_totals(
    job: &Job,
    bids: &[Bid],
    milestones: &[Milestone],
) -> Result<(), InvariantViolation> {
    let accepted = bids
        .iter()
        .filter(|b| b.job_id == job.id && b.status == BidStatus::Accepted)
        .count();
    if accepted > 1 {
        return Err(InvariantViolation::MultipleAcceptedBids {
            job_id: job.id,
            count: accepted,
        });
    }

    let completed = Amount::sum(
        milestones
            .iter()
            .filter(|m| m.job_id == job.id && m.status == MilestoneStatus::Completed)
            .map(|m| m.amount),
    )
    .map_err(|_| InvariantViolation::TotalOverflow { job_id: job.id })?;
    let agreed = job.agreed_total.unwrap_or(Amount::ZERO);
    if completed > agreed {
        return Err(InvariantViolation::OverReleased {
            job_id: job.id,
            completed,
            agreed,
        });
    }
    Ok(())
}

// ── Transitions ────────────────────────────────────────────────────────

/// A requested job transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Accept `bid_id`, rejecting every sibling bid.
    Assign {
        /// The bid to accept.
        bid_id: BidId,
    },
    /// Begin work.
    Start,
    /// Close out a job whose milestones have all settled.
    Complete,
    /// Cancel the job, refunding escrowed milestones.
    Cancel {
        /// Free-form reason recorded on the job.
        reason: String,
    },
}

impl JobAction {
    fn kind(&self) -> JobActionKind {
        match self {
            Self::Assign { .. } => JobActionKind::Assign,
            Self::Start => JobActionKind::Start,
            Self::Complete => JobActionKind::Complete,
            Self::Cancel { .. } => JobActionKind::Cancel,
        }
    }

    /// Action name used in logs and audit records.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Sibling entities a job transition needs to see.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    /// Every bid on the job.
    pub bids: &'a [Bid],
    /// Every milestone on the job.
    pub milestones: &'a [Milestone],
    /// Funding window applied at assignment.
    pub fund_window: Option<Duration>,
    /// Transition time.
    pub now: DateTime<Utc>,
}

/// Result of an applied job transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    /// The job after the transition.
    pub job: Job,
    /// Bids whose status changed.
    pub bids: Vec<Bid>,
    /// Milestones whose status changed.
    pub milestones: Vec<Milestone>,
    /// Settlement intents to hand to escrow.
    pub intents: Vec<Intent>,
    /// Events to publish once committed.
    pub events: Vec<DomainEvent>,
}

/// Validate and apply `action` to `job`.
pub fn transition_job(
    job: &Job,
    action: JobAction,
    actor: &Actor,
    ctx: &JobContext<'_>,
) -> Result<JobTransition, Rejection> {
    let kind = action.kind();
    if !actor.is_one_of(kind.permitted_roles()) {
        return Err(Rejection::forbidden(
            format!("{} job", kind.as_str()),
            actor.role,
        ));
    }

    let target = job_edge(job.status, kind).ok_or_else(|| {
        Rejection::invalid(
            EntityKind::Job,
            job.status,
            kind.as_str(),
            if job.status.is_terminal() {
                "job is in a terminal state".to_string()
            } else {
                format!("allowed next states: {:?}", job.status.valid_transitions())
            },
        )
    })?;

    match action {
        JobAction::Assign { bid_id } => assign(job, bid_id, target, actor, ctx),
        JobAction::Start => {
            let mut next = job.advanced(target, kind.as_str(), actor, ctx.now);
            next.started_at = Some(ctx.now);
            Ok(JobTransition {
                job: next,
                bids: Vec::new(),
                milestones: Vec::new(),
                intents: Vec::new(),
                events: Vec::new(),
            })
        }
        JobAction::Complete => complete(job, target, actor, ctx),
        JobAction::Cancel { reason } => cancel(job, reason, target, actor, ctx),
    }
}

fn assign(
    job: &Job,
    bid_id: BidId,
    target: JobStatus,
    actor: &Actor,
    ctx: &JobContext<'_>,
) -> Result<JobTransition, Rejection> {
    let bid = ctx
        .bids
        .iter()
        .find(|b| b.id == bid_id)
        .ok_or_else(|| Rejection::not_found(EntityKind::Bid, bid_id))?;
    if bid.job_id != job.id {
        return Err(Rejection::validation(format!(
            "bid {bid_id} belongs to another job"
        )));
    }
    if ctx
        .bids
        .iter()
        .any(|b| b.job_id == job.id && b.status == BidStatus::Accepted)
    {
        return Err(Rejection::invalid(
            EntityKind::Job,
            job.status,
            "assign",
            "a bid has already been accepted",
        ));
    }
    if !bid.status.is_live() {
        return Err(Rejection::invalid(
            EntityKind::Bid,
            bid.status,
            "accept",
            "only a pending bid can be accepted",
        ));
    }
    if !job.budget.contains(bid.amount) {
        return Err(Rejection::validation(format!(
            "bid amount {} is outside the budget {}..={}",
            bid.amount, job.budget.min, job.budget.max
        )));
    }

    let predefined: Vec<&Milestone> = ctx
        .milestones
        .iter()
        .filter(|m| m.job_id == job.id && m.status != MilestoneStatus::Cancelled)
        .collect();
    if !predefined.is_empty() {
        let total = Amount::sum(predefined.iter().map(|m| m.amount))?;
        if total != bid.amount {
            return Err(Rejection::validation(format!(
                "milestones total {total} but the accepted amount is {}",
                bid.amount
            )));
        }
    }

    let mut next = job.advanced(target, "assign", actor, ctx.now);
    next.freelancer = Some(bid.freelancer);
    next.accepted_bid = Some(bid.id);
    next.agreed_total = Some(bid.amount);
    next.assigned_at = Some(ctx.now);
    next.fund_deadline = ctx.fund_window.map(|w| ctx.now + w);

    let mut bids = Vec::new();
    for b in ctx.bids.iter().filter(|b| b.job_id == job.id) {
        if b.id == bid.id {
            bids.push(b.with_status(BidStatus::Accepted, ctx.now));
        } else if b.status.is_live() {
            bids.push(b.with_status(BidStatus::Rejected, ctx.now));
        }
    }

    let event = DomainEvent::new(EventKind::JobAssigned, job.id, ctx.now, next.parties())
        .for_job(job.id)
        .with_payload(serde_json::json!({
            "bid_id": bid.id,
            "agreed_total": bid.amount,
        }));

    tracing::debug!(job_id = %job.id, bid_id = %bid.id, "job assigned");

    Ok(JobTransition {
        job: next,
        bids,
        milestones: Vec::new(),
        intents: Vec::new(),
        events: vec![event],
    })
}

fn complete(
    job: &Job,
    target: JobStatus,
    actor: &Actor,
    ctx: &JobContext<'_>,
) -> Result<JobTransition, Rejection> {
    let live: Vec<&Milestone> = ctx
        .milestones
        .iter()
        .filter(|m| m.job_id == job.id && m.status != MilestoneStatus::Cancelled)
        .collect();
    if live.is_empty() {
        return Err(Rejection::invalid(
            EntityKind::Job,
            job.status,
            "complete",
            "job has no milestones",
        ));
    }
    let outstanding = live
        .iter()
        .filter(|m| m.status != MilestoneStatus::Completed)
        .count();
    if outstanding > 0 {
        return Err(Rejection::invalid(
            EntityKind::Job,
            job.status,
            "complete",
            format!("{outstanding} milestone(s) not completed"),
        ));
    }

    let mut next = job.advanced(target, "complete", actor, ctx.now);
    next.completed_at = Some(ctx.now);
    let event = DomainEvent::new(EventKind::JobCompleted, job.id, ctx.now, job.parties())
        .for_job(job.id);
    Ok(JobTransition {
        job: next,
        bids: Vec::new(),
        milestones: Vec::new(),
        intents: Vec::new(),
        events: vec![event],
    })
}

fn cancel(
    job: &Job,
    reason: String,
    target: JobStatus,
    actor: &Actor,
    ctx: &JobContext<'_>,
) -> Result<JobTransition, Rejection> {
    let owned: Vec<&Milestone> = ctx
        .milestones
        .iter()
        .filter(|m| m.job_id == job.id)
        .collect();
    if let Some(blocking) = owned
        .iter()
        .find(|m| m.status.blocks_cancellation() || m.pending_batch.is_some())
    {
        return Err(Rejection::invalid(
            EntityKind::Job,
            job.status,
            "cancel",
            format!(
                "milestone {} is {} with settlement in flight or under review",
                blocking.id, blocking.status
            ),
        ));
    }

    let mut milestones = Vec::new();
    let mut intents = Vec::new();
    for m in owned.iter().filter(|m| !m.status.is_terminal()) {
        if m.status.holds_escrow() {
            intents.push(Intent::refund(
                job.id,
                m.id,
                m.amount,
                job.client,
                job.freelancer,
            ));
        }
        milestones.push(m.cancelled(actor, ctx.now)?);
    }

    let bids = ctx
        .bids
        .iter()
        .filter(|b| b.job_id == job.id && b.status.is_live())
        .map(|b| b.with_status(BidStatus::Rejected, ctx.now))
        .collect();

    let notify = job.parties();
    let mut next = job.advanced(target, "cancel", actor, ctx.now);
    next.freelancer = None;
    next.cancelled_at = Some(ctx.now);
    next.cancellation_reason = Some(reason.clone());

    let event = DomainEvent::new(EventKind::JobCancelled, job.id, ctx.now, notify)
        .for_job(job.id)
        .with_payload(serde_json::json!({
            "reason": reason,
            "by": actor.role,
            "refunds": intents.len(),
        }));

    Ok(JobTransition {
        job: next,
        bids,
        milestones,
        intents,
        events: vec![event],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::NewBid;
    use crate::milestone::NewMilestone;
    use proptest::prelude::*;

    fn amt(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    fn open_job(client: UserId) -> Job {
        Job::create(
            client,
            NewJob {
                title: "Landing page".into(),
                description: "Marketing site".into(),
                category: "web".into(),
                budget: BudgetBounds::new(amt("500"), amt("1000")).unwrap(),
                currency: "USD".into(),
                bidding_closes_at: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn bid_on(job: &Job, amount: &str) -> Bid {
        Bid::place(
            job,
            &[],
            UserId::new(),
            NewBid {
                amount: amt(amount),
                delivery_days: 10,
                cover_note: "hello".into(),
            },
            Utc::now(),
        )
        .unwrap()
        .0
    }

    fn ctx<'a>(bids: &'a [Bid], milestones: &'a [Milestone]) -> JobContext<'a> {
        JobContext {
            bids,
            milestones,
            fund_window: Some(Duration::hours(72)),
            now: Utc::now(),
        }
    }

    #[test]
    fn create_validates_input() {
        let client = UserId::new();
        let mut input = NewJob {
            title: "".into(),
            description: String::new(),
            category: "web".into(),
            budget: BudgetBounds {
                min: amt("1"),
                max: amt("2"),
            },
            currency: "USD".into(),
            bidding_closes_at: None,
        };
        assert!(Job::create(client, input.clone(), Utc::now()).is_err());
        input.title = "ok".into();
        input.currency = "usd".into();
        assert!(Job::create(client, input.clone(), Utc::now()).is_err());
        input.currency = "USD".into();
        input.budget = BudgetBounds {
            min: amt("5"),
            max: amt("2"),
        };
        assert!(Job::create(client, input.clone(), Utc::now()).is_err());
    }

    #[test]
    fn assign_accepts_bid_and_rejects_siblings() {
        let client = UserId::new();
        let job = open_job(client);
        let winner = bid_on(&job, "800");
        let loser = bid_on(&job, "900");
        let bids = vec![winner.clone(), loser.clone()];

        let t = transition_job(
            &job,
            JobAction::Assign { bid_id: winner.id },
            &Actor::client(client),
            &ctx(&bids, &[]),
        )
        .unwrap();

        assert_eq!(t.job.status, JobStatus::Assigned);
        assert_eq!(t.job.freelancer, Some(winner.freelancer));
        assert_eq!(t.job.agreed_total, Some(amt("800")));
        assert_eq!(t.job.version, job.version + 1);
        assert!(t.job.fund_deadline.is_some());
        assert!(t.job.check_invariants().is_ok());
        let statuses: Vec<_> = t.bids.iter().map(|b| (b.id, b.status)).collect();
        assert!(statuses.contains(&(winner.id, BidStatus::Accepted)));
        assert!(statuses.contains(&(loser.id, BidStatus::Rejected)));
        assert_eq!(t.events[0].kind, EventKind::JobAssigned);
    }

    #[test]
    fn second_assign_is_invalid_transition() {
        let client = UserId::new();
        let job = open_job(client);
        let a = bid_on(&job, "800");
        let b = bid_on(&job, "900");
        let bids = vec![a.clone(), b.clone()];
        let t = transition_job(
            &job,
            JobAction::Assign { bid_id: a.id },
            &Actor::client(client),
            &ctx(&bids, &[]),
        )
        .unwrap();

        let err = transition_job(
            &t.job,
            JobAction::Assign { bid_id: b.id },
            &Actor::client(client),
            &ctx(&t.bids, &[]),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::InvalidTransition);
    }

    #[test]
    fn freelancer_cannot_assign() {
        let job = open_job(UserId::new());
        let bid = bid_on(&job, "800");
        let err = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::freelancer(bid.freelancer),
            &ctx(std::slice::from_ref(&bid), &[]),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::Forbidden);
    }

    #[test]
    fn forbidden_is_reported_before_state() {
        let client = UserId::new();
        let mut job = open_job(client);
        job.status = JobStatus::Completed;
        let err = transition_job(
            &job,
            JobAction::Cancel {
                reason: "x".into(),
            },
            &Actor::visitor(UserId::new()),
            &ctx(&[], &[]),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::Forbidden);
    }

    #[test]
    fn predefined_milestones_must_match_bid() {
        let client = UserId::new();
        let job = open_job(client);
        let bid = bid_on(&job, "900");
        let m = Milestone::create(
            &job,
            &[],
            &Actor::client(client),
            NewMilestone {
                title: "all".into(),
                description: String::new(),
                amount: amt("1000"),
                fund_by: None,
            },
            Utc::now(),
        )
        .unwrap();
        let err = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::client(client),
            &ctx(std::slice::from_ref(&bid), std::slice::from_ref(&m)),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::ValidationFailed);
    }

    #[test]
    fn complete_requires_all_milestones_completed() {
        let client = UserId::new();
        let job = open_job(client);
        let bid = bid_on(&job, "1000");
        let assigned = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::client(client),
            &ctx(std::slice::from_ref(&bid), &[]),
        )
        .unwrap()
        .job;
        let started = transition_job(
            &assigned,
            JobAction::Start,
            &Actor::freelancer(bid.freelancer),
            &ctx(&[], &[]),
        )
        .unwrap()
        .job;

        let err = transition_job(
            &started,
            JobAction::Complete,
            &Actor::system(),
            &ctx(&[], &[]),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::InvalidTransition);
    }

    #[test]
    fn cancel_clears_freelancer_and_refunds_funded() {
        let client = UserId::new();
        let job = open_job(client);
        let bid = bid_on(&job, "1000");
        let assigned = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::client(client),
            &ctx(std::slice::from_ref(&bid), &[]),
        )
        .unwrap()
        .job;
        let pending = Milestone::create(
            &assigned,
            &[],
            &Actor::client(client),
            NewMilestone {
                title: "a".into(),
                description: String::new(),
                amount: amt("400"),
                fund_by: None,
            },
            Utc::now(),
        )
        .unwrap();
        let mut funded = pending.clone();
        funded.id = gig_core::MilestoneId::new();
        funded.status = MilestoneStatus::Funded;

        let milestones = vec![pending, funded.clone()];
        let t = transition_job(
            &assigned,
            JobAction::Cancel {
                reason: "changed plans".into(),
            },
            &Actor::client(client),
            &ctx(&[], &milestones),
        )
        .unwrap();

        assert_eq!(t.job.status, JobStatus::Cancelled);
        assert_eq!(t.job.freelancer, None);
        assert!(t.job.check_invariants().is_ok());
        assert_eq!(t.intents.len(), 1);
        assert_eq!(t.intents[0].milestone_id, funded.id);
        assert!(t
            .milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Cancelled));
    }

    #[test]
    fn cancel_blocked_by_submitted_milestone() {
        let client = UserId::new();
        let job = open_job(client);
        let bid = bid_on(&job, "1000");
        let assigned = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::client(client),
            &ctx(std::slice::from_ref(&bid), &[]),
        )
        .unwrap()
        .job;
        let mut m = Milestone::create(
            &assigned,
            &[],
            &Actor::client(client),
            NewMilestone {
                title: "a".into(),
                description: String::new(),
                amount: amt("400"),
                fund_by: None,
            },
            Utc::now(),
        )
        .unwrap();
        m.status = MilestoneStatus::Submitted;
        let err = transition_job(
            &assigned,
            JobAction::Cancel { reason: "x".into() },
            &Actor::client(client),
            &ctx(&[], std::slice::from_ref(&m)),
        )
        .unwrap_err();
        assert_eq!(err.code(), gig_core::RejectionCode::InvalidTransition);
    }

    #[test]
    fn invariant_checker_flags_dangling_freelancer() {
        let mut job = open_job(UserId::new());
        job.freelancer = Some(UserId::new());
        assert!(matches!(
            job.check_invariants(),
            Err(InvariantViolation::UnexpectedFreelancer { .. })
        ));
        job.freelancer = None;
        job.status = JobStatus::InProgress;
        assert!(matches!(
            job.check_invariants(),
            Err(InvariantViolation::MissingFreelancer { .. })
        ));
    }

    #[test]
    fn role_resolution() {
        let client = UserId::new();
        let mut job = open_job(client);
        let f = UserId::new();
        job.freelancer = Some(f);
        assert_eq!(job.role_of(client), Role::Client);
        assert_eq!(job.role_of(f), Role::Freelancer);
        assert_eq!(job.role_of(UserId::new()), Role::Visitor);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Assign(usize),
        Start,
        Complete,
        Cancel,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3).prop_map(Step::Assign),
            Just(Step::Start),
            Just(Step::Complete),
            Just(Step::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn freelancer_iff_engaged_status(steps in proptest::collection::vec(step(), 0..12)) {
            let client = UserId::new();
            let mut job = open_job(client);
            let mut bids: Vec<Bid> = (0..3).map(|_| bid_on(&job, "700")).collect();
            for s in steps {
                let (action, actor) = match s {
                    Step::Assign(i) => (JobAction::Assign { bid_id: bids[i].id }, Actor::client(client)),
                    Step::Start => (JobAction::Start, Actor::system()),
                    Step::Complete => (JobAction::Complete, Actor::system()),
                    Step::Cancel => (JobAction::Cancel { reason: "r".into() }, Actor::client(client)),
                };
                if let Ok(t) = transition_job(&job, action, &actor, &ctx(&bids, &[])) {
                    for changed in t.bids {
                        if let Some(slot) = bids.iter_mut().find(|b| b.id == changed.id) {
                            *slot = changed;
                        }
                    }
                    job = t.job;
                }
                prop_assert!(job.check_invariants().is_ok());
                prop_assert_eq!(job.freelancer.is_some(), job.status.requires_freelancer());
                let accepted = bids.iter().filter(|b| b.status == BidStatus::Accepted).count();
                prop_assert!(accepted <= 1);
            }
        }
    }
}
