//! # Domain Events
//!
//! Outbound notifications emitted after a transition is persisted. Delivery
//! (email, push, realtime channel) belongs to an external collaborator
//! reached through the [`EventPublisher`] trait, which each component
//! receives by injection.
//!
//! ## Delivery Semantics
//!
//! Publishing happens after state is committed. A failed publish is logged
//! and dropped; it never rolls a transition back, so "payment succeeded but
//! the notification failed" leaves consistent state behind.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{JobId, UserId};

/// Kinds of outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A bid was placed on an open job.
    BidPlaced,
    /// A bid was accepted and the job assigned.
    JobAssigned,
    /// A milestone was funded into escrow.
    MilestoneFunded,
    /// Work was submitted for a milestone.
    MilestoneSubmitted,
    /// The client approved a submission.
    MilestoneApproved,
    /// The client rejected a submission.
    MilestoneRejected,
    /// A milestone was contested.
    MilestoneDisputed,
    /// Settlement for a milestone was fully confirmed.
    MilestoneCompleted,
    /// An arbiter resolved a dispute.
    DisputeResolved,
    /// An arbiter dismissed a dispute.
    DisputeDismissed,
    /// All milestones of a job completed.
    JobCompleted,
    /// A job was cancelled by a party or by the expiry sweep.
    JobCancelled,
    /// Settlement permanently rejected an intent; state was rolled back.
    SettlementFailed,
    /// Settlement retries exhausted or partially applied; needs an operator.
    SettlementStalled,
    /// A reputation tier was reached; minting is handled externally.
    ReputationBadgeEarned,
}

impl EventKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BidPlaced => "BID_PLACED",
            Self::JobAssigned => "JOB_ASSIGNED",
            Self::MilestoneFunded => "MILESTONE_FUNDED",
            Self::MilestoneSubmitted => "MILESTONE_SUBMITTED",
            Self::MilestoneApproved => "MILESTONE_APPROVED",
            Self::MilestoneRejected => "MILESTONE_REJECTED",
            Self::MilestoneDisputed => "MILESTONE_DISPUTED",
            Self::MilestoneCompleted => "MILESTONE_COMPLETED",
            Self::DisputeResolved => "DISPUTE_RESOLVED",
            Self::DisputeDismissed => "DISPUTE_DISMISSED",
            Self::JobCompleted => "JOB_COMPLETED",
            Self::JobCancelled => "JOB_CANCELLED",
            Self::SettlementFailed => "SETTLEMENT_FAILED",
            Self::SettlementStalled => "SETTLEMENT_STALLED",
            Self::ReputationBadgeEarned => "REPUTATION_BADGE_EARNED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification about a committed state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event id, usable for de-duplication downstream.
    pub event_id: Uuid,
    /// What happened.
    pub kind: EventKind,
    /// The entity the event is about.
    pub entity_id: Uuid,
    /// Owning job, when the entity belongs to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// When the underlying transition was applied.
    pub occurred_at: DateTime<Utc>,
    /// Parties to notify.
    pub notify: Vec<UserId>,
    /// Event-specific detail.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Build an event about `entity_id`.
    pub fn new(
        kind: EventKind,
        entity_id: impl Into<Uuid>,
        occurred_at: DateTime<Utc>,
        notify: Vec<UserId>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            entity_id: entity_id.into(),
            job_id: None,
            occurred_at,
            notify,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach the owning job.
    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Error returned by a publisher that could not hand an event off.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event publish failed: {0}")]
pub struct PublishError(pub String);

/// Outbound seam to the notification collaborator.
pub trait EventPublisher: Send + Sync {
    /// Hand one event to the delivery channel.
    fn publish(&self, event: &DomainEvent) -> Result<(), PublishError>;
}

/// Publish every event, logging and swallowing individual failures.
///
/// Returns the number of events that were handed off successfully.
pub fn publish_all(publisher: &dyn EventPublisher, events: &[DomainEvent]) -> usize {
    let mut delivered = 0;
    for event in events {
        match publisher.publish(event) {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(
                    event_id = %event.event_id,
                    kind = %event.kind,
                    entity_id = %event.entity_id,
                    error = %e,
                    "domain event dropped"
                );
            }
        }
    }
    delivered
}

/// Publisher that emits each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        tracing::info!(
            event_id = %event.event_id,
            kind = %event.kind,
            entity_id = %event.entity_id,
            notify = event.notify.len(),
            "domain event"
        );
        Ok(())
    }
}

/// In-memory publisher that records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<DomainEvent>>,
    fail: Mutex<bool>,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (events are not recorded).
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<DomainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of recorded events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        if *self.fail.lock() {
            return Err(PublishError("recorder set to fail".into()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
