//! # gig-reputation: Reputation Sync Service
//!
//! Derives per-role reputation from job history. Records are never edited
//! incrementally: [`ReputationService::sync_user_reputation`] recomputes
//! everything from the [`ReputationHistory`] and writes the result, so a
//! second run with no new activity is a no-op.
//!
//! Decay is applied separately by
//! [`ReputationService::apply_reputation_decay`], always from the base
//! score, at most once per UTC day.

pub mod error;
pub mod model;
pub mod score;
pub mod service;
pub mod store;

pub use error::ReputationError;
pub use model::{Achievement, Badge, HistoryEvent, ReputationRecord, ReputationRole};
pub use service::{DecayReport, IntegrityReport, ReputationConfig, ReputationService, SyncReport};
pub use store::{MemoryHistory, MemoryReputationStore, ReputationHistory, ReputationStore};
