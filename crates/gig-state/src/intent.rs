//! # Settlement Intents
//!
//! A transition that moves money does not compute legs or fees. It emits an
//! abstract [`Intent`] naming the milestone, the gross amount, and the two
//! parties; the escrow planner turns it into concrete settlement legs at a
//! single computation point.

use gig_core::{Amount, JobId, MilestoneId, UserId};
use serde::{Deserialize, Serialize};

use crate::milestone::MilestoneStatus;

/// Direction of a fund movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Client → escrow.
    Fund,
    /// Escrow → freelancer.
    Release,
    /// Escrow → client.
    Refund,
    /// Escrow → both parties in arbiter-specified shares.
    Split,
}

impl IntentKind {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fund => "fund",
            Self::Release => "release",
            Self::Refund => "refund",
            Self::Split => "split",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to move a milestone's funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Direction.
    pub kind: IntentKind,
    /// Owning job.
    pub job_id: JobId,
    /// Milestone whose funds move.
    pub milestone_id: MilestoneId,
    /// Gross milestone amount.
    pub amount: Amount,
    /// Paying/refunded party.
    pub client: UserId,
    /// Receiving party. Required for release and split.
    pub freelancer: Option<UserId>,
    /// Freelancer's gross share for a split. The client receives the rest.
    pub freelancer_share: Option<Amount>,
    /// Status to restore if settlement permanently fails. `None` means the
    /// transition cannot be undone and a failure must stall for an operator.
    pub revert_to: Option<MilestoneStatus>,
}

impl Intent {
    fn base(
        kind: IntentKind,
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
        client: UserId,
        freelancer: Option<UserId>,
    ) -> Self {
        Self {
            kind,
            job_id,
            milestone_id,
            amount,
            client,
            freelancer,
            freelancer_share: None,
            revert_to: None,
        }
    }

    /// Deposit a milestone into escrow.
    pub fn fund(
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
        client: UserId,
        freelancer: Option<UserId>,
    ) -> Self {
        Self::base(IntentKind::Fund, job_id, milestone_id, amount, client, freelancer)
            .reverting_to(MilestoneStatus::Pending)
    }

    /// Pay an approved milestone out to the freelancer.
    pub fn release(
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
        client: UserId,
        freelancer: UserId,
    ) -> Self {
        Self::base(
            IntentKind::Release,
            job_id,
            milestone_id,
            amount,
            client,
            Some(freelancer),
        )
    }

    /// Return escrowed funds to the client.
    pub fn refund(
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
        client: UserId,
        freelancer: Option<UserId>,
    ) -> Self {
        Self::base(IntentKind::Refund, job_id, milestone_id, amount, client, freelancer)
    }

    /// Divide escrowed funds between the parties.
    pub fn split(
        job_id: JobId,
        milestone_id: MilestoneId,
        amount: Amount,
        client: UserId,
        freelancer: UserId,
        freelancer_share: Amount,
    ) -> Self {
        let mut intent = Self::base(
            IntentKind::Split,
            job_id,
            milestone_id,
            amount,
            client,
            Some(freelancer),
        );
        intent.freelancer_share = Some(freelancer_share);
        intent
    }

    /// Set the status restored on permanent failure.
    pub fn reverting_to(mut self, status: MilestoneStatus) -> Self {
        self.revert_to = Some(status);
        self
    }
}
