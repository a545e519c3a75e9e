//! # gig-arbitration: Dispute Resolver
//!
//! The dispute sub-lifecycle for contested milestones: raise, arbiter
//! claim, resolve (release, refund or split) and dismiss, with age and SLA
//! tracking for the arbiter queue.
//!
//! Resolution hands its decision to the escrow planner, so split shares are
//! validated and fees computed at the same single point as every other
//! payout.

pub mod dispute;
pub mod error;

pub use dispute::{
    overdue, Dispute, DisputeStatus, Resolution, ResolutionAction, ResolutionOutcome,
};
pub use error::DisputeError;
