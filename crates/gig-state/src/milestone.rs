//! # Milestone Lifecycle
//!
//! ```text
//!  Pending ─fund─▶ Funded ─start─▶ InProgress ─submit─▶ Submitted ─approve─▶ Approved
//!                                      ▲                  │  │                 │
//!                                      │     Rejected ◀─reject                 │
//!                                      └──── (submit) ────┘  │                 │
//!                                                         dispute           dispute
//!                                                            ▼                 ▼
//!                                                         Disputed ◀───────────┘
//!                                                            │ arbiter resolves
//!                                                            ▼
//!                                                     DisputedResolved
//!
//!  Approved / DisputedResolved ──settlement acknowledged──▶ Completed
//! ```
//!
//! Actor-driven edges live in a static table; anything absent from it is an
//! `InvalidTransition`. The settlement-driven edges (`apply_settlement`,
//! `revert_settlement`, `mark_resolved`, `restore_after_dismissal`,
//! `cancelled`) are separate methods callable only with the system or
//! arbiter actor, because no client or freelancer may complete a milestone
//! directly.
//!
//! ## Security Invariant
//!
//! `Completed` is reachable only from `Approved` or `DisputedResolved`, and
//! only through [`Milestone::apply_settlement`], which requires a pending
//! settlement batch. There is no path from `Pending` to `Completed`.

use chrono::{DateTime, Utc};
use gig_core::{
    Actor, Amount, BatchId, DomainEvent, EntityKind, EventKind, JobId, MilestoneId, Rejection,
    Role,
};
use serde::{Deserialize, Serialize};

use crate::intent::Intent;
use crate::job::{Job, JobStatus};
use crate::log::TransitionRecord;

// ── Milestone Status ───────────────────────────────────────────────────

/// Lifecycle state of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Funded,
    InProgress,
    Submitted,
    Approved,
    Rejected,
    Disputed,
    DisputedResolved,
    Completed,
    Cancelled,
}

impl MilestoneStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::InProgress => "in_progress",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Disputed => "disputed",
            Self::DisputedResolved => "disputed_resolved",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions exist.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether escrow holds this milestone's funds.
    pub fn holds_escrow(&self) -> bool {
        matches!(
            self,
            Self::Funded
                | Self::InProgress
                | Self::Submitted
                | Self::Approved
                | Self::Rejected
                | Self::Disputed
                | Self::DisputedResolved
        )
    }

    /// Whether the job may not be cancelled while a milestone is here.
    pub fn blocks_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Approved | Self::Disputed | Self::DisputedResolved
        )
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MilestoneStatus {
    type Err = Rejection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "funded" => Self::Funded,
            "in_progress" => Self::InProgress,
            "submitted" => Self::Submitted,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "disputed" => Self::Disputed,
            "disputed_resolved" => Self::DisputedResolved,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            other => {
                return Err(Rejection::validation(format!(
                    "unknown milestone status {other:?}"
                )))
            }
        })
    }
}

// ── Transition Table ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Fund,
    Start,
    Submit,
    Approve,
    Reject,
    Dispute,
}

impl ActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::Start => "start",
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Dispute => "dispute",
        }
    }

    fn permitted_roles(&self) -> &'static [Role] {
        match self {
            Self::Fund | Self::Approve | Self::Reject => &[Role::Client],
            Self::Start | Self::Submit => &[Role::Freelancer],
            Self::Dispute => &[Role::Client, Role::Freelancer],
        }
    }
}

use MilestoneStatus as S;

const MILESTONE_EDGES: &[(MilestoneStatus, ActionKind, MilestoneStatus)] = &[
    (S::Pending, ActionKind::Fund, S::Funded),
    (S::Funded, ActionKind::Start, S::InProgress),
    (S::InProgress, ActionKind::Submit, S::Submitted),
    (S::Rejected, ActionKind::Submit, S::Submitted),
    (S::Submitted, ActionKind::Approve, S::Approved),
    (S::Submitted, ActionKind::Reject, S::Rejected),
    (S::Submitted, ActionKind::Dispute, S::Disputed),
    (S::Approved, ActionKind::Dispute, S::Disputed),
];

fn milestone_edge(from: MilestoneStatus, action: ActionKind) -> Option<MilestoneStatus> {
    MILESTONE_EDGES
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

// ── Milestone ──────────────────────────────────────────────────────────

/// Input for [`Milestone::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMilestone {
    pub title: String,
    pub description: String,
    pub amount: Amount,
    /// If still pending at this instant, the sweep cancels the milestone.
    pub fund_by: Option<DateTime<Utc>>,
}

/// A funded sub-deliverable of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub job_id: JobId,
    pub title: String,
    pub description: String,
    pub amount: Amount,
    pub status: MilestoneStatus,
    pub version: u64,
    /// Delivery package id or external artifact reference.
    pub submission_ref: Option<String>,
    pub approval_note: Option<String>,
    pub feedback: Option<String>,
    pub rejection_count: u32,
    /// Status the milestone held when it was disputed.
    pub pre_dispute_status: Option<MilestoneStatus>,
    /// Settlement batch currently in flight.
    pub pending_batch: Option<BatchId>,
    /// Status restored if the in-flight batch permanently fails.
    pub settlement_revert_to: Option<MilestoneStatus>,
    /// Settlement needs an operator.
    pub settlement_stalled: bool,
    pub fund_by: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub transition_log: Vec<TransitionRecord<MilestoneStatus>>,
}

/// Tunables applied to milestone transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestonePolicy {
    /// Submissions a client may reject before a dispute is required.
    pub max_rejections: Option<u32>,
}

/// What a milestone transition needs to know about its surroundings.
#[derive(Debug, Clone, Copy)]
pub struct MilestoneContext<'a> {
    /// The owning job.
    pub job: &'a Job,
    /// Active policy.
    pub policy: &'a MilestonePolicy,
    /// A dispute on this milestone is pending or under review.
    pub dispute_open: bool,
    /// Transition time.
    pub now: DateTime<Utc>,
}

/// A requested actor-driven milestone transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilestoneAction {
    /// Deposit the milestone amount into escrow.
    Fund,
    /// Begin work on a funded milestone.
    Start,
    /// Hand in work.
    Submit {
        /// Delivery package id or artifact reference.
        reference: String,
    },
    /// Accept the submission and release funds.
    Approve {
        /// Optional note for the freelancer.
        note: Option<String>,
    },
    /// Send the submission back with feedback.
    Reject {
        /// Required feedback.
        feedback: String,
    },
    /// Contest the submission or pending release.
    Dispute,
}

impl MilestoneAction {
    fn kind(&self) -> ActionKind {
        match self {
            Self::Fund => ActionKind::Fund,
            Self::Start => ActionKind::Start,
            Self::Submit { .. } => ActionKind::Submit,
            Self::Approve { .. } => ActionKind::Approve,
            Self::Reject { .. } => ActionKind::Reject,
            Self::Dispute => ActionKind::Dispute,
        }
    }

    /// Action name used in logs and audit records.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Result of an applied milestone transition.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestoneTransition {
    /// The milestone after the transition.
    pub milestone: Milestone,
    /// Settlement intents to hand to escrow.
    pub intents: Vec<Intent>,
    /// Events to publish once committed.
    pub events: Vec<DomainEvent>,
}

impl Milestone {
    /// Add a milestone to `job`. `existing` holds the job's other milestones.
    ///
    /// While the job is open the running total is capped by the budget
    /// maximum; afterwards by what remains of the agreed total.
    pub fn create(
        job: &Job,
        existing: &[Milestone],
        actor: &Actor,
        input: NewMilestone,
        now: DateTime<Utc>,
    ) -> Result<Milestone, Rejection> {
        if actor.role != Role::Client {
            return Err(Rejection::forbidden("add milestone", actor.role));
        }
        if !matches!(
            job.status,
            JobStatus::Open | JobStatus::Assigned | JobStatus::InProgress
        ) {
            return Err(Rejection::invalid(
                EntityKind::Job,
                job.status,
                "add milestone",
                "job no longer accepts milestones",
            ));
        }
        if input.title.trim().is_empty() {
            return Err(Rejection::validation("milestone title must not be empty"));
        }
        if input.amount.is_zero() {
            return Err(Rejection::validation("milestone amount must be positive"));
        }
        if input.fund_by.is_some_and(|deadline| deadline <= now) {
            return Err(Rejection::validation("funding deadline must be in the future"));
        }

        let committed = Amount::sum(
            existing
                .iter()
                .filter(|m| m.job_id == job.id && m.status != MilestoneStatus::Cancelled)
                .map(|m| m.amount),
        )?;
        let cap = match job.agreed_total {
            Some(agreed) if job.status != JobStatus::Open => agreed,
            _ => job.budget.max,
        };
        let remaining = cap.checked_sub(committed).unwrap_or(Amount::ZERO);
        if input.amount > remaining {
            return Err(Rejection::validation(format!(
                "milestone amount {} exceeds the remaining budget {remaining}",
                input.amount
            )));
        }

        Ok(Milestone {
            id: MilestoneId::new(),
            job_id: job.id,
            title: input.title,
            description: input.description,
            amount: input.amount,
            status: MilestoneStatus::Pending,
            version: 1,
            submission_ref: None,
            approval_note: None,
            feedback: None,
            rejection_count: 0,
            pre_dispute_status: None,
            pending_batch: None,
            settlement_revert_to: None,
            settlement_stalled: false,
            fund_by: input.fund_by,
            created_at: now,
            funded_at: None,
            started_at: None,
            submitted_at: None,
            approved_at: None,
            rejected_at: None,
            disputed_at: None,
            resolved_at: None,
            completed_at: None,
            cancelled_at: None,
            transition_log: Vec::new(),
        })
    }

    /// Record that settlement batch `batch` now carries this milestone's funds.
    pub fn attach_settlement(&self, batch: BatchId, revert_to: Option<MilestoneStatus>) -> Milestone {
        let mut next = self.clone();
        next.pending_batch = Some(batch);
        next.settlement_revert_to = revert_to;
        next.settlement_stalled = false;
        next.version += 1;
        next
    }

    /// The in-flight batch was fully acknowledged.
    ///
    /// Funding confirmation keeps the status; release confirmation moves
    /// `Approved`/`DisputedResolved` to `Completed`; refund confirmation of a
    /// cancelled milestone only clears the batch.
    pub fn apply_settlement(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<(Milestone, Vec<DomainEvent>), Rejection> {
        if self.pending_batch.is_none() {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "settle",
                "no settlement in flight",
            ));
        }
        let mut events = Vec::new();
        let mut next = match self.status {
            S::Approved | S::DisputedResolved => {
                let mut n = self.advanced(S::Completed, "settle", &Actor::system(), now);
                n.completed_at = Some(now);
                events.push(
                    DomainEvent::new(EventKind::MilestoneCompleted, self.id, now, job.parties())
                        .for_job(self.job_id)
                        .with_payload(serde_json::json!({ "amount": self.amount })),
                );
                n
            }
            S::Funded | S::InProgress | S::Cancelled => {
                let mut n = self.clone();
                n.version += 1;
                n
            }
            other => {
                return Err(Rejection::invalid(
                    EntityKind::Milestone,
                    other,
                    "settle",
                    "settlement does not apply in this state",
                ))
            }
        };
        next.pending_batch = None;
        next.settlement_revert_to = None;
        next.settlement_stalled = false;
        Ok((next, events))
    }

    /// The in-flight batch permanently failed before any leg moved money.
    pub fn revert_settlement(
        &self,
        job: &Job,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Milestone, DomainEvent), Rejection> {
        let batch = self.pending_batch.ok_or_else(|| {
            Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "revert settlement",
                "no settlement in flight",
            )
        })?;
        let to = self.settlement_revert_to.ok_or_else(|| {
            Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "revert settlement",
                "transition cannot be reverted",
            )
        })?;
        let mut next = self.advanced(to, "revert settlement", &Actor::system(), now);
        next.pending_batch = None;
        next.settlement_revert_to = None;
        next.settlement_stalled = false;
        match to {
            S::Pending => next.funded_at = None,
            S::Submitted => {
                next.approved_at = None;
                next.approval_note = None;
            }
            _ => {}
        }
        let event = DomainEvent::new(EventKind::SettlementFailed, self.id, now, job.parties())
            .for_job(self.job_id)
            .with_payload(serde_json::json!({
                "batch_id": batch,
                "reverted_to": to,
                "reason": reason,
            }));
        Ok((next, event))
    }

    /// Mark the in-flight settlement as needing an operator.
    pub fn flag_stalled(&self, job: &Job, reason: &str, now: DateTime<Utc>) -> (Milestone, DomainEvent) {
        self.flag_batch_stalled(job, self.pending_batch, reason, now)
    }

    /// Mark `batch` as needing an operator. Also used for a batch the
    /// milestone has already let go of but on which funds still moved.
    pub fn flag_batch_stalled(
        &self,
        job: &Job,
        batch: Option<BatchId>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> (Milestone, DomainEvent) {
        let mut next = self.clone();
        next.settlement_stalled = true;
        next.version += 1;
        let event = DomainEvent::new(EventKind::SettlementStalled, self.id, now, job.parties())
            .for_job(self.job_id)
            .with_payload(serde_json::json!({
                "batch_id": batch,
                "reason": reason,
            }));
        (next, event)
    }

    /// Arbiter decision recorded: `Disputed` → `DisputedResolved`.
    pub fn mark_resolved(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Milestone, Rejection> {
        if !actor.is_one_of(&[Role::Arbiter, Role::System]) {
            return Err(Rejection::forbidden("resolve milestone dispute", actor.role));
        }
        if self.status != S::Disputed {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "resolve",
                "milestone is not disputed",
            ));
        }
        if self.settlement_stalled {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "resolve",
                "settlement needs operator reconciliation",
            ));
        }
        let mut next = self.advanced(S::DisputedResolved, "resolve", actor, now);
        next.resolved_at = Some(now);
        Ok(next)
    }

    /// Dispute dismissed: return to the status held before it was raised.
    pub fn restore_after_dismissal(
        &self,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Milestone, Rejection> {
        if !actor.is_one_of(&[Role::Arbiter, Role::System]) {
            return Err(Rejection::forbidden("dismiss milestone dispute", actor.role));
        }
        if self.status != S::Disputed {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "restore",
                "milestone is not disputed",
            ));
        }
        if self.settlement_stalled {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "restore",
                "settlement needs operator reconciliation",
            ));
        }
        let to = self.pre_dispute_status.unwrap_or(S::Submitted);
        let mut next = self.advanced(to, "restore", actor, now);
        next.pre_dispute_status = None;
        Ok(next)
    }

    /// Cancel as part of job cancellation or deadline expiry.
    pub fn cancelled(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Milestone, Rejection> {
        if !actor.is_one_of(&[Role::Client, Role::Arbiter, Role::System]) {
            return Err(Rejection::forbidden("cancel milestone", actor.role));
        }
        if self.status.is_terminal() || self.status.blocks_cancellation() {
            return Err(Rejection::invalid(
                EntityKind::Milestone,
                self.status,
                "cancel",
                "milestone is settled or under review",
            ));
        }
        let mut next = self.advanced(S::Cancelled, "cancel", actor, now);
        next.cancelled_at = Some(now);
        Ok(next)
    }

    fn advanced(&self, to: MilestoneStatus, action: &str, actor: &Actor, now: DateTime<Utc>) -> Milestone {
        let mut next = self.clone();
        next.transition_log
            .push(TransitionRecord::new(self.status, to, action, *actor, now));
        next.status = to;
        next.version += 1;
        next
    }
}

// ── Actor-driven transitions ───────────────────────────────────────────

/// Validate and apply `action` to `milestone`.
pub fn transition_milestone(
    milestone: &Milestone,
    action: MilestoneAction,
    actor: &Actor,
    ctx: &MilestoneContext<'_>,
) -> Result<MilestoneTransition, Rejection> {
    let kind = action.kind();
    if !actor.is_one_of(kind.permitted_roles()) {
        return Err(Rejection::forbidden(
            format!("{} milestone", kind.as_str()),
            actor.role,
        ));
    }

    let job = ctx.job;
    if job.id != milestone.job_id {
        return Err(Rejection::validation(format!(
            "milestone {} does not belong to job {}",
            milestone.id, job.id
        )));
    }
    if !job.status.is_active() {
        return Err(Rejection::invalid(
            EntityKind::Milestone,
            milestone.status,
            kind.as_str(),
            format!("job is {}", job.status),
        ));
    }
    if ctx.dispute_open && matches!(kind, ActionKind::Approve | ActionKind::Reject) {
        return Err(Rejection::invalid(
            EntityKind::Milestone,
            milestone.status,
            kind.as_str(),
            "an open dispute holds authority over this milestone",
        ));
    }

    let target = milestone_edge(milestone.status, kind).ok_or_else(|| {
        Rejection::invalid(
            EntityKind::Milestone,
            milestone.status,
            kind.as_str(),
            "no such edge in the milestone transition table",
        )
    })?;

    let now = ctx.now;
    let parties = job.parties();
    let mut next = milestone.advanced(target, kind.as_str(), actor, now);
    let mut intents = Vec::new();
    let mut events = Vec::new();

    match action {
        MilestoneAction::Fund => {
            next.funded_at = Some(now);
            intents.push(Intent::fund(
                job.id,
                milestone.id,
                milestone.amount,
                job.client,
                job.freelancer,
            ));
            events.push(
                DomainEvent::new(EventKind::MilestoneFunded, milestone.id, now, parties)
                    .for_job(job.id)
                    .with_payload(serde_json::json!({ "amount": milestone.amount })),
            );
        }
        MilestoneAction::Start => {
            if milestone.pending_batch.is_some() {
                return Err(Rejection::invalid(
                    EntityKind::Milestone,
                    milestone.status,
                    "start",
                    "funding has not been confirmed by settlement",
                ));
            }
            next.started_at = Some(now);
        }
        MilestoneAction::Submit { reference } => {
            if reference.trim().is_empty() {
                return Err(Rejection::validation("submission reference must not be empty"));
            }
            next.submission_ref = Some(reference);
            next.submitted_at = Some(now);
            events.push(
                DomainEvent::new(EventKind::MilestoneSubmitted, milestone.id, now, vec![job.client])
                    .for_job(job.id),
            );
        }
        MilestoneAction::Approve { note } => {
            let freelancer = job.freelancer.ok_or_else(|| {
                Rejection::invalid(
                    EntityKind::Job,
                    job.status,
                    "approve milestone",
                    "job has no freelancer",
                )
            })?;
            next.approval_note = note;
            next.approved_at = Some(now);
            intents.push(
                Intent::release(job.id, milestone.id, milestone.amount, job.client, freelancer)
                    .reverting_to(MilestoneStatus::Submitted),
            );
            events.push(
                DomainEvent::new(EventKind::MilestoneApproved, milestone.id, now, parties)
                    .for_job(job.id),
            );
        }
        MilestoneAction::Reject { feedback } => {
            if feedback.trim().is_empty() {
                return Err(Rejection::validation("rejection feedback must not be empty"));
            }
            if let Some(max) = ctx.policy.max_rejections {
                if milestone.rejection_count >= max {
                    return Err(Rejection::invalid(
                        EntityKind::Milestone,
                        milestone.status,
                        "reject",
                        format!("rejection limit of {max} reached; raise a dispute instead"),
                    ));
                }
            }
            next.feedback = Some(feedback);
            next.rejection_count += 1;
            next.rejected_at = Some(now);
            let notify = job.freelancer.into_iter().collect();
            events.push(
                DomainEvent::new(EventKind::MilestoneRejected, milestone.id, now, notify)
                    .for_job(job.id),
            );
        }
        MilestoneAction::Dispute => {
            next.pre_dispute_status = Some(milestone.status);
            next.disputed_at = Some(now);
            next.pending_batch = None;
            next.settlement_revert_to = None;
            next.settlement_stalled = false;
            events.push(
                DomainEvent::new(EventKind::MilestoneDisputed, milestone.id, now, parties)
                    .for_job(job.id)
                    .with_payload(serde_json::json!({ "raised_by": actor.role })),
            );
        }
    }

    Ok(MilestoneTransition {
        milestone: next,
        intents,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::{Bid, NewBid};
    use crate::intent::IntentKind;
    use crate::job::{transition_job, BudgetBounds, JobAction, JobContext, NewJob};
    use gig_core::{RejectionCode, UserId};

    struct Fixture {
        job: Job,
        client: UserId,
        freelancer: UserId,
        milestone: Milestone,
    }

    fn fixture() -> Fixture {
        let client = UserId::new();
        let freelancer = UserId::new();
        let now = Utc::now();
        let job = Job::create(
            client,
            NewJob {
                title: "Logo".into(),
                description: String::new(),
                category: "design".into(),
                budget: BudgetBounds::new(
                    Amount::parse("1000").unwrap(),
                    Amount::parse("1000").unwrap(),
                )
                .unwrap(),
                currency: "USD".into(),
                bidding_closes_at: None,
            },
            now,
        )
        .unwrap();
        let milestone = Milestone::create(
            &job,
            &[],
            &Actor::client(client),
            NewMilestone {
                title: "Everything".into(),
                description: String::new(),
                amount: Amount::parse("1000").unwrap(),
                fund_by: None,
            },
            now,
        )
        .unwrap();
        let (bid, _) = Bid::place(
            &job,
            &[],
            freelancer,
            NewBid {
                amount: Amount::parse("1000").unwrap(),
                delivery_days: 3,
                cover_note: String::new(),
            },
            now,
        )
        .unwrap();
        let job = transition_job(
            &job,
            JobAction::Assign { bid_id: bid.id },
            &Actor::client(client),
            &JobContext {
                bids: std::slice::from_ref(&bid),
                milestones: std::slice::from_ref(&milestone),
                fund_window: None,
                now,
            },
        )
        .unwrap()
        .job;
        Fixture {
            job,
            client,
            freelancer,
            milestone,
        }
    }

    const POLICY: MilestonePolicy = MilestonePolicy {
        max_rejections: Some(2),
    };

    fn apply(
        f: &Fixture,
        m: &Milestone,
        action: MilestoneAction,
        actor: Actor,
    ) -> Result<MilestoneTransition, Rejection> {
        transition_milestone(
            m,
            action,
            &actor,
            &MilestoneContext {
                job: &f.job,
                policy: &POLICY,
                dispute_open: false,
                now: Utc::now(),
            },
        )
    }

    fn drive_to_submitted(f: &Fixture) -> Milestone {
        let funded = apply(f, &f.milestone, MilestoneAction::Fund, Actor::client(f.client))
            .unwrap()
            .milestone;
        let started = apply(f, &funded, MilestoneAction::Start, Actor::freelancer(f.freelancer))
            .unwrap()
            .milestone;
        apply(
            f,
            &started,
            MilestoneAction::Submit {
                reference: "delivery-1".into(),
            },
            Actor::freelancer(f.freelancer),
        )
        .unwrap()
        .milestone
    }

    #[test]
    fn fund_emits_fund_intent() {
        let f = fixture();
        let t = apply(&f, &f.milestone, MilestoneAction::Fund, Actor::client(f.client)).unwrap();
        assert_eq!(t.milestone.status, MilestoneStatus::Funded);
        assert_eq!(t.intents.len(), 1);
        assert_eq!(t.intents[0].kind, IntentKind::Fund);
        assert_eq!(t.intents[0].revert_to, Some(MilestoneStatus::Pending));
        assert_eq!(t.events[0].kind, EventKind::MilestoneFunded);
    }

    #[test]
    fn freelancer_cannot_fund() {
        let f = fixture();
        let err = apply(
            &f,
            &f.milestone,
            MilestoneAction::Fund,
            Actor::freelancer(f.freelancer),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::Forbidden);
    }

    #[test]
    fn role_is_checked_before_state() {
        let f = fixture();
        // Approve from pending is illegal, but a visitor must learn only Forbidden.
        let err = apply(
            &f,
            &f.milestone,
            MilestoneAction::Approve { note: None },
            Actor::visitor(UserId::new()),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::Forbidden);
    }

    #[test]
    fn no_direct_pending_to_completed() {
        let f = fixture();
        let err = apply(
            &f,
            &f.milestone,
            MilestoneAction::Approve { note: None },
            Actor::client(f.client),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
        assert!(f.milestone.apply_settlement(&f.job, Utc::now()).is_err());
    }

    #[test]
    fn start_waits_for_funding_confirmation() {
        let f = fixture();
        let funded = apply(&f, &f.milestone, MilestoneAction::Fund, Actor::client(f.client))
            .unwrap()
            .milestone
            .attach_settlement(BatchId::new(), Some(MilestoneStatus::Pending));
        let err = apply(&f, &funded, MilestoneAction::Start, Actor::freelancer(f.freelancer))
            .unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);

        let (confirmed, events) = funded.apply_settlement(&f.job, Utc::now()).unwrap();
        assert!(events.is_empty());
        assert_eq!(confirmed.status, MilestoneStatus::Funded);
        assert!(apply(&f, &confirmed, MilestoneAction::Start, Actor::freelancer(f.freelancer)).is_ok());
    }

    #[test]
    fn approve_then_settle_completes() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let t = apply(
            &f,
            &submitted,
            MilestoneAction::Approve {
                note: Some("great".into()),
            },
            Actor::client(f.client),
        )
        .unwrap();
        assert_eq!(t.milestone.status, MilestoneStatus::Approved);
        assert_eq!(t.intents[0].kind, IntentKind::Release);
        assert_eq!(t.intents[0].freelancer, Some(f.freelancer));

        let in_flight = t
            .milestone
            .attach_settlement(BatchId::new(), t.intents[0].revert_to);
        let (done, events) = in_flight.apply_settlement(&f.job, Utc::now()).unwrap();
        assert_eq!(done.status, MilestoneStatus::Completed);
        assert_eq!(events[0].kind, EventKind::MilestoneCompleted);
        assert!(done.pending_batch.is_none());
    }

    #[test]
    fn permanent_failure_reverts_to_submitted() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let t = apply(
            &f,
            &submitted,
            MilestoneAction::Approve { note: None },
            Actor::client(f.client),
        )
        .unwrap();
        let in_flight = t
            .milestone
            .attach_settlement(BatchId::new(), t.intents[0].revert_to);
        let (reverted, event) = in_flight
            .revert_settlement(&f.job, "account closed", Utc::now())
            .unwrap();
        assert_eq!(reverted.status, MilestoneStatus::Submitted);
        assert!(reverted.approved_at.is_none());
        assert_eq!(event.kind, EventKind::SettlementFailed);
    }

    #[test]
    fn reject_is_bounded() {
        let f = fixture();
        let mut m = drive_to_submitted(&f);
        for _ in 0..2 {
            m = apply(
                &f,
                &m,
                MilestoneAction::Reject {
                    feedback: "needs work".into(),
                },
                Actor::client(f.client),
            )
            .unwrap()
            .milestone;
            assert_eq!(m.status, MilestoneStatus::Rejected);
            m = apply(
                &f,
                &m,
                MilestoneAction::Submit {
                    reference: "again".into(),
                },
                Actor::freelancer(f.freelancer),
            )
            .unwrap()
            .milestone;
        }
        let err = apply(
            &f,
            &m,
            MilestoneAction::Reject {
                feedback: "still no".into(),
            },
            Actor::client(f.client),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
        assert_eq!(m.rejection_count, 2);
    }

    #[test]
    fn open_dispute_blocks_approve() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let err = transition_milestone(
            &submitted,
            MilestoneAction::Approve { note: None },
            &Actor::client(f.client),
            &MilestoneContext {
                job: &f.job,
                policy: &POLICY,
                dispute_open: true,
                now: Utc::now(),
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
    }

    #[test]
    fn dispute_from_approved_and_resolution() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let approved = apply(
            &f,
            &submitted,
            MilestoneAction::Approve { note: None },
            Actor::client(f.client),
        )
        .unwrap()
        .milestone
        .attach_settlement(BatchId::new(), Some(MilestoneStatus::Submitted));
        let disputed = apply(
            &f,
            &approved,
            MilestoneAction::Dispute,
            Actor::client(f.client),
        )
        .unwrap()
        .milestone;
        assert_eq!(disputed.status, MilestoneStatus::Disputed);
        assert_eq!(disputed.pre_dispute_status, Some(MilestoneStatus::Approved));
        assert!(disputed.pending_batch.is_none());

        assert!(disputed
            .mark_resolved(&Actor::client(f.client), Utc::now())
            .is_err());
        let resolved = disputed
            .mark_resolved(&Actor::arbiter(UserId::new()), Utc::now())
            .unwrap();
        assert_eq!(resolved.status, MilestoneStatus::DisputedResolved);
    }

    #[test]
    fn stalled_dispute_cannot_be_resolved_or_dismissed() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let disputed = apply(
            &f,
            &submitted,
            MilestoneAction::Dispute,
            Actor::client(f.client),
        )
        .unwrap()
        .milestone;
        let batch = BatchId::new();
        let (stalled, event) =
            disputed.flag_batch_stalled(&f.job, Some(batch), "funds moved on abandoned batch", Utc::now());
        assert!(stalled.settlement_stalled);
        assert_eq!(event.payload["batch_id"], serde_json::json!(batch));

        let arbiter = Actor::arbiter(UserId::new());
        let err = stalled.mark_resolved(&arbiter, Utc::now()).unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
        let err = stalled.restore_after_dismissal(&arbiter, Utc::now()).unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
    }

    #[test]
    fn dispute_clears_a_stall_on_the_abandoned_batch() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let approved = apply(
            &f,
            &submitted,
            MilestoneAction::Approve { note: None },
            Actor::client(f.client),
        )
        .unwrap()
        .milestone
        .attach_settlement(BatchId::new(), Some(MilestoneStatus::Submitted));
        let (stalled, _) = approved.flag_stalled(&f.job, "retries exhausted", Utc::now());
        let disputed = apply(&f, &stalled, MilestoneAction::Dispute, Actor::client(f.client))
            .unwrap()
            .milestone;
        assert!(!disputed.settlement_stalled);
    }

    #[test]
    fn dismissal_restores_previous_status() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        let disputed = apply(
            &f,
            &submitted,
            MilestoneAction::Dispute,
            Actor::freelancer(f.freelancer),
        )
        .unwrap()
        .milestone;
        let restored = disputed
            .restore_after_dismissal(&Actor::arbiter(UserId::new()), Utc::now())
            .unwrap();
        assert_eq!(restored.status, MilestoneStatus::Submitted);
    }

    #[test]
    fn cannot_dispute_pending() {
        let f = fixture();
        let err = apply(
            &f,
            &f.milestone,
            MilestoneAction::Dispute,
            Actor::freelancer(f.freelancer),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::InvalidTransition);
    }

    #[test]
    fn create_respects_remaining_budget() {
        let f = fixture();
        let err = Milestone::create(
            &f.job,
            std::slice::from_ref(&f.milestone),
            &Actor::client(f.client),
            NewMilestone {
                title: "extra".into(),
                description: String::new(),
                amount: Amount::parse("0.01").unwrap(),
                fund_by: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), RejectionCode::ValidationFailed);
    }

    #[test]
    fn every_transition_bumps_version() {
        let f = fixture();
        let submitted = drive_to_submitted(&f);
        assert_eq!(submitted.version, f.milestone.version + 3);
        assert_eq!(submitted.transition_log.len(), 3);
    }
}
