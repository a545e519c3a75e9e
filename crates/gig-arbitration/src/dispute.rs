//! # Dispute Lifecycle
//!
//! ```text
//!  Pending ──claim──▶ UnderReview ──resolve──▶ Resolved
//!     │                    │
//!     │                    └──dismiss──▶ Dismissed
//!     ├──resolve (auto-claims first)──▶ Resolved
//!     └──dismiss──▶ Dismissed
//! ```
//!
//! A dispute owns authority over its milestone while open: approve and
//! reject are refused until it is resolved or dismissed. Resolution does not
//! move money itself. It produces a [`SettlementPlan`] through the escrow
//! planner, which validates split shares and computes fees, and the caller
//! dispatches it after marking the milestone `disputed_resolved`.

use chrono::{DateTime, Duration, Utc};
use gig_core::{
    Actor, Amount, DisputeId, DomainEvent, EventKind, JobId, MilestoneId, Role, UserId,
};
use gig_escrow::{validate_split, FeeSchedule, SettlementPlan};
use gig_state::{Intent, Job, Milestone, MilestoneStatus, TransitionRecord};
use serde::{Deserialize, Serialize};

use crate::error::DisputeError;

// ── Dispute Status ─────────────────────────────────────────────────────

/// Lifecycle state of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    /// Raised, waiting for an arbiter.
    Pending,
    /// Claimed by an arbiter.
    UnderReview,
    /// Decided; settlement follows. Terminal.
    Resolved,
    /// Rejected without a ruling. Terminal.
    Dismissed,
}

impl DisputeStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    /// Whether no further transitions exist.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }

    /// Whether the dispute blocks approve/reject on its milestone.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses reachable in one step.
    pub fn valid_transitions(&self) -> &'static [DisputeStatus] {
        match self {
            Self::Pending => &[Self::UnderReview, Self::Resolved, Self::Dismissed],
            Self::UnderReview => &[Self::Resolved, Self::Dismissed],
            Self::Resolved | Self::Dismissed => &[],
        }
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Resolution ─────────────────────────────────────────────────────────

/// What the arbiter decided to do with the disputed funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Pay the full amount to the freelancer.
    ReleaseToFreelancer,
    /// Return the full amount to the client.
    RefundToClient,
    /// Divide the amount; the shares must sum to it exactly.
    Split { freelancer: Amount, client: Amount },
}

impl ResolutionAction {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleaseToFreelancer => "release_to_freelancer",
            Self::RefundToClient => "refund_to_client",
            Self::Split { .. } => "split",
        }
    }
}

/// A recorded arbiter decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: ResolutionAction,
    pub arbiter: UserId,
    pub note: String,
    pub resolved_at: DateTime<Utc>,
}

// ── Dispute ────────────────────────────────────────────────────────────

/// A contested milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub job_id: JobId,
    pub milestone_id: MilestoneId,
    pub raised_by: UserId,
    pub raised_by_role: Role,
    pub reason: String,
    /// The milestone amount under dispute.
    pub amount: Amount,
    pub status: DisputeStatus,
    /// Arbiter who claimed the dispute.
    pub arbiter: Option<UserId>,
    pub resolution: Option<Resolution>,
    pub dismissal_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub transition_log: Vec<TransitionRecord<DisputeStatus>>,
}

/// Result of [`Dispute::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    /// The dispute after resolution.
    pub dispute: Dispute,
    /// Legs to dispatch once the milestone is marked resolved.
    pub plan: SettlementPlan,
    /// `DisputeResolved` notification.
    pub event: DomainEvent,
}

impl Dispute {
    /// Open a dispute on `milestone`.
    ///
    /// The caller applies the milestone's own `Dispute` transition in the
    /// same critical section; this only builds the dispute record.
    pub fn raise(
        job: &Job,
        milestone: &Milestone,
        actor: &Actor,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Dispute, DisputeError> {
        let raised_by = match (actor.role, actor.user_id) {
            (Role::Client, Some(u)) if u == job.client => u,
            (Role::Freelancer, Some(u)) if job.freelancer == Some(u) => u,
            _ => {
                return Err(DisputeError::Forbidden {
                    action: "raise dispute".into(),
                    role: actor.role,
                })
            }
        };
        if milestone.job_id != job.id {
            return Err(DisputeError::Validation(
                "milestone belongs to another job".into(),
            ));
        }
        if !matches!(
            milestone.status,
            MilestoneStatus::Submitted | MilestoneStatus::Approved
        ) {
            return Err(DisputeError::InvalidTransition {
                from: milestone.status.to_string(),
                action: "raise".into(),
                reason: "only submitted or approved milestones can be disputed".into(),
            });
        }
        if reason.trim().is_empty() {
            return Err(DisputeError::Validation("dispute reason must not be empty".into()));
        }
        Ok(Dispute {
            id: DisputeId::new(),
            job_id: job.id,
            milestone_id: milestone.id,
            raised_by,
            raised_by_role: actor.role,
            reason,
            amount: milestone.amount,
            status: DisputeStatus::Pending,
            arbiter: None,
            resolution: None,
            dismissal_reason: None,
            version: 1,
            created_at: now,
            claimed_at: None,
            closed_at: None,
            transition_log: Vec::new(),
        })
    }

    /// Arbiter takes the dispute: Pending → UnderReview.
    pub fn claim(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Dispute, DisputeError> {
        let arbiter = require_arbiter(actor, "claim dispute")?;
        self.require_open()?;
        if self.status != DisputeStatus::Pending {
            return Err(DisputeError::InvalidTransition {
                from: self.status.to_string(),
                action: "claim".into(),
                reason: "dispute is already under review".into(),
            });
        }
        let mut next = self.advanced(DisputeStatus::UnderReview, "claim", actor, now);
        next.arbiter = Some(arbiter);
        next.claimed_at = Some(now);
        Ok(next)
    }

    /// Arbiter rules on the dispute. A pending dispute is claimed first.
    pub fn resolve(
        &self,
        job: &Job,
        actor: &Actor,
        action: ResolutionAction,
        note: String,
        fees: &FeeSchedule,
        now: DateTime<Utc>,
    ) -> Result<ResolutionOutcome, DisputeError> {
        let arbiter = require_arbiter(actor, "resolve dispute")?;
        self.require_open()?;
        let claimed = match self.status {
            DisputeStatus::Pending => self.claim(actor, now)?,
            _ => self.clone(),
        };
        if claimed.arbiter != Some(arbiter) {
            return Err(DisputeError::Forbidden {
                action: "resolve a dispute claimed by another arbiter".into(),
                role: actor.role,
            });
        }

        let intent = self.intent_for(job, action)?;
        let plan = gig_escrow::plan(&intent, fees)?;

        let mut next = claimed.advanced(DisputeStatus::Resolved, "resolve", actor, now);
        next.resolution = Some(Resolution {
            action,
            arbiter,
            note,
            resolved_at: now,
        });
        next.closed_at = Some(now);

        let event = DomainEvent::new(EventKind::DisputeResolved, self.id, now, job.parties())
            .for_job(self.job_id)
            .with_payload(serde_json::json!({
                "milestone_id": self.milestone_id,
                "resolution": action,
            }));
        tracing::info!(
            dispute_id = %self.id,
            milestone_id = %self.milestone_id,
            action = action.as_str(),
            "dispute resolved"
        );
        Ok(ResolutionOutcome {
            dispute: next,
            plan,
            event,
        })
    }

    /// Arbiter closes the dispute without a ruling.
    pub fn dismiss(
        &self,
        job: &Job,
        actor: &Actor,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(Dispute, DomainEvent), DisputeError> {
        let arbiter = require_arbiter(actor, "dismiss dispute")?;
        self.require_open()?;
        if self.arbiter.is_some_and(|a| a != arbiter) {
            return Err(DisputeError::Forbidden {
                action: "dismiss a dispute claimed by another arbiter".into(),
                role: actor.role,
            });
        }
        if reason.trim().is_empty() {
            return Err(DisputeError::Validation("dismissal reason must not be empty".into()));
        }
        let mut next = self.advanced(DisputeStatus::Dismissed, "dismiss", actor, now);
        next.arbiter = Some(arbiter);
        next.dismissal_reason = Some(reason);
        next.closed_at = Some(now);
        let event = DomainEvent::new(EventKind::DisputeDismissed, self.id, now, job.parties())
            .for_job(self.job_id)
            .with_payload(serde_json::json!({ "milestone_id": self.milestone_id }));
        Ok((next, event))
    }

    /// Time since the dispute was raised, or its full lifetime once closed.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        self.closed_at.unwrap_or(now) - self.created_at
    }

    /// Whether an open dispute has waited longer than `threshold`.
    pub fn sla_breached(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.status.is_open() && self.age(now) > threshold
    }

    fn intent_for(&self, job: &Job, action: ResolutionAction) -> Result<Intent, DisputeError> {
        let freelancer = job.freelancer.ok_or_else(|| {
            DisputeError::Validation("job has no freelancer to settle with".into())
        })?;
        Ok(match action {
            ResolutionAction::ReleaseToFreelancer => Intent::release(
                job.id,
                self.milestone_id,
                self.amount,
                job.client,
                freelancer,
            ),
            ResolutionAction::RefundToClient => Intent::refund(
                job.id,
                self.milestone_id,
                self.amount,
                job.client,
                Some(freelancer),
            ),
            ResolutionAction::Split {
                freelancer: share,
                client,
            } => {
                validate_split(self.amount, share, client)?;
                Intent::split(
                    job.id,
                    self.milestone_id,
                    self.amount,
                    job.client,
                    freelancer,
                    share,
                )
            }
        })
    }

    fn require_open(&self) -> Result<(), DisputeError> {
        if self.status.is_terminal() {
            return Err(DisputeError::TerminalState {
                dispute_id: self.id.to_string(),
                state: self.status.to_string(),
            });
        }
        Ok(())
    }

    fn advanced(&self, to: DisputeStatus, action: &str, actor: &Actor, now: DateTime<Utc>) -> Dispute {
        let mut next = self.clone();
        next.transition_log
            .push(TransitionRecord::new(self.status, to, action, *actor, now));
        next.status = to;
        next.version += 1;
        next
    }
}

fn require_arbiter(actor: &Actor, action: &str) -> Result<UserId, DisputeError> {
    match (actor.role, actor.user_id) {
        (Role::Arbiter, Some(user)) => Ok(user),
        _ => Err(DisputeError::Forbidden {
            action: action.into(),
            role: actor.role,
        }),
    }
}

/// Open disputes that have waited longer than `threshold`, oldest first.
pub fn overdue<'a>(
    disputes: impl IntoIterator<Item = &'a Dispute>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<&'a Dispute> {
    let mut late: Vec<&Dispute> = disputes
        .into_iter()
        .filter(|d| d.sla_breached(now, threshold))
        .collect();
    late.sort_by_key(|d| d.created_at);
    late
}
