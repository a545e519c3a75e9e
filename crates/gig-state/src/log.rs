//! Append-only transition audit entries shared by every stateful entity.

use chrono::{DateTime, Utc};
use gig_core::Actor;
use serde::{Deserialize, Serialize};

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord<S> {
    /// State before.
    pub from: S,
    /// State after.
    pub to: S,
    /// Action name that caused the transition.
    pub action: String,
    /// Who requested it.
    pub actor: Actor,
    /// When it was applied.
    pub at: DateTime<Utc>,
}

impl<S> TransitionRecord<S> {
    /// Build a record.
    pub fn new(from: S, to: S, action: impl Into<String>, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            action: action.into(),
            actor,
            at,
        }
    }
}
