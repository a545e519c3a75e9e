#![deny(missing_docs)]

//! # gig-core: Foundational Types for the Escrow Engine
//!
//! Every other crate in the workspace depends on this one. It carries no
//! internal dependencies and owns the vocabulary shared by the state
//! machine, the escrow coordinator, the dispute resolver and the API:
//!
//! - **Identifiers**: one UUID newtype per entity kind. A [`MilestoneId`]
//!   cannot be passed where a [`JobId`] is expected.
//! - **[`Amount`]**: fixed-point money in minor units. Floating point never
//!   touches a monetary value anywhere in the workspace.
//! - **[`Actor`] / [`Role`]**: who is asking, resolved relative to a job.
//! - **[`Rejection`]**: the typed rejection taxonomy with stable reason
//!   codes. Transition functions return it instead of panicking.
//! - **[`DomainEvent`] / [`EventPublisher`]**: outbound notifications and the
//!   injected publisher seam. There is no process-wide event bus.

pub mod actor;
pub mod amount;
pub mod error;
pub mod event;
pub mod identity;

pub use actor::{Actor, Role};
pub use amount::{Amount, AmountError};
pub use error::{EntityKind, Rejection, RejectionCode};
pub use event::{
    publish_all, DomainEvent, EventKind, EventPublisher, PublishError, RecordingPublisher,
    TracingPublisher,
};
pub use identity::{
    BatchId, BidId, DeliveryId, DisputeId, IntentId, InvoiceId, JobId, MilestoneId, ReviewId,
    SessionId, UserId,
};
