//! # gig-state: State Machine Engine
//!
//! Pure transition logic for the entities a job owns. Every function here
//! takes the current entity by reference, the requested action, and the
//! resolved [`Actor`](gig_core::Actor), and returns either the next entity
//! value plus side effects (settlement [`Intent`]s and
//! [`DomainEvent`](gig_core::DomainEvent)s) or a typed
//! [`Rejection`](gig_core::Rejection). Nothing is persisted here; the caller
//! commits the returned values under a compare-and-swap on `version`.
//!
//! ## Check Order
//!
//! 1. Role authority (`Forbidden`): before any state is inspected, so an
//!    unauthorized actor learns nothing about the entity.
//! 2. Parent/blocking conditions (job status, open dispute).
//! 3. The static transition table (`InvalidTransition`).
//! 4. Action-specific validation (`ValidationFailed`).
//!
//! ## Modules
//!
//! - [`job`]: job lifecycle, assignment, cancellation, invariants.
//! - [`bid`]: bid placement and the bid sub-lifecycle.
//! - [`milestone`]: milestone lifecycle and settlement-driven transitions.
//! - [`delivery`]: delivery packages and manifest digests.
//! - [`intent`]: abstract settlement intents handed to the escrow planner.

pub mod bid;
pub mod delivery;
pub mod intent;
pub mod job;
pub mod log;
pub mod milestone;

pub use bid::{Bid, BidStatus, NewBid};
pub use delivery::{DeliveryPackage, DeliveryStatus, FileEntry};
pub use intent::{Intent, IntentKind};
pub use job::{
    check_milestone_totals, transition_job, BudgetBounds, InvariantViolation, Job, JobAction,
    JobContext, JobStatus, JobTransition, NewJob,
};
pub use log::TransitionRecord;
pub use milestone::{
    transition_milestone, Milestone, MilestoneAction, MilestoneContext, MilestonePolicy,
    MilestoneStatus, MilestoneTransition, NewMilestone,
};
