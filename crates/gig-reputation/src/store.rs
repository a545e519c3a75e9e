//! History and record storage seams with in-memory implementations.

use std::collections::{BTreeMap, HashMap};

use gig_core::UserId;
use parking_lot::RwLock;

use crate::error::ReputationError;
use crate::model::{HistoryEvent, ReputationRecord, ReputationRole};

/// Read access to the facts reputation is derived from.
pub trait ReputationHistory: Send + Sync {
    /// Every history event concerning `user`.
    fn events_for(&self, user: UserId) -> Result<Vec<HistoryEvent>, ReputationError>;
}

/// Where derived records live. Only the sync service writes here.
pub trait ReputationStore: Send + Sync {
    /// Stored record for `(user, role)`.
    fn get(&self, user: UserId, role: ReputationRole) -> Result<Option<ReputationRecord>, ReputationError>;

    /// Insert or replace the record for its `(user, role)`.
    fn upsert(&self, record: ReputationRecord) -> Result<(), ReputationError>;

    /// Every stored record, ordered by `(user, role)`.
    fn all(&self) -> Result<Vec<ReputationRecord>, ReputationError>;
}

/// Append-only in-memory history.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    events: RwLock<HashMap<UserId, Vec<HistoryEvent>>>,
}

impl MemoryHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event for `user`.
    pub fn record(&self, user: UserId, event: HistoryEvent) {
        self.events.write().entry(user).or_default().push(event);
    }
}

impl ReputationHistory for MemoryHistory {
    fn events_for(&self, user: UserId) -> Result<Vec<HistoryEvent>, ReputationError> {
        Ok(self.events.read().get(&user).cloned().unwrap_or_default())
    }
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryReputationStore {
    records: RwLock<BTreeMap<(UserId, ReputationRole), ReputationRecord>>,
}

impl MemoryReputationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReputationStore for MemoryReputationStore {
    fn get(&self, user: UserId, role: ReputationRole) -> Result<Option<ReputationRecord>, ReputationError> {
        Ok(self.records.read().get(&(user, role)).cloned())
    }

    fn upsert(&self, record: ReputationRecord) -> Result<(), ReputationError> {
        self.records
            .write()
            .insert((record.user_id, record.role), record);
        Ok(())
    }

    fn all(&self) -> Result<Vec<ReputationRecord>, ReputationError> {
        Ok(self.records.read().values().cloned().collect())
    }
}
