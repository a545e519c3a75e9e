//! # gig-escrow: Escrow Coordinator
//!
//! Turns abstract settlement [`Intent`](gig_state::Intent)s into concrete
//! money movements and tracks them until they settle.
//!
//! - **Planning** ([`plan`]): the only place leg amounts and platform fees
//!   are computed. Split shares are validated here.
//! - **Journal** ([`journal`]): every leg is recorded before dispatch.
//! - **Gateway** ([`gateway`], [`http`]): the `SettlementGateway` seam with
//!   an in-memory mock and a reqwest-backed client.
//! - **Coordinator** ([`coordinator`]): dispatch with bounded exponential
//!   backoff ([`retry`]), asynchronous acknowledgments, batch outcomes,
//!   voiding and operator retry.
//!
//! The coordinator never touches milestone state. Callers read the
//! [`BatchOutcome`] and apply the matching settlement-driven transition.

pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod http;
pub mod journal;
pub mod plan;
pub mod retry;

pub use coordinator::{
    AckOutcome, AckStatus, BatchOutcome, EscrowCoordinator, SettlementAck, SubmitOutcome,
};
pub use error::EscrowError;
pub use gateway::{
    GatewayError, GatewayResponse, MockOutcome, MockSettlementGateway, SettlementGateway,
};
pub use http::{HttpGatewayConfig, HttpSettlementGateway, IDEMPOTENCY_HEADER};
pub use journal::{Abandoned, IntentJournal, JournalEntry, LegStatus, SettlementReceipt};
pub use plan::{plan, validate_split, FeeSchedule, Party, SettlementIntent, SettlementPlan};
pub use retry::RetryPolicy;
