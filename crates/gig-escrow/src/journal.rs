//! # Intent Journal
//!
//! Every settlement leg is written here as `pending` before it is sent to
//! the gateway, so a crash between "decided to pay" and "gateway answered"
//! leaves a record an operator can reconcile. Entries are keyed by intent
//! id; the gateway treats the same id as the same payment, which is what
//! makes re-dispatch safe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gig_core::{BatchId, IntentId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::plan::SettlementIntent;

/// Where a leg stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    /// Recorded; dispatched or awaiting acknowledgment.
    Pending,
    /// Funds moved.
    Confirmed,
    /// Gateway refused permanently.
    Failed,
    /// Retries exhausted; operator attention required.
    Stalled,
    /// Cancelled before any money moved.
    Voided,
    /// Funds moved on a leg that had already been voided or failed, or on a
    /// batch its milestone abandoned. Needs operator reconciliation.
    Orphaned,
}

impl LegStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
            Self::Voided => "voided",
            Self::Orphaned => "orphaned",
        }
    }

    /// Whether money moved on this leg.
    pub fn moved_funds(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Orphaned)
    }

    /// Whether the leg may still move money.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Stalled)
    }
}

impl std::fmt::Display for LegStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that a leg settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub intent_id: IntentId,
    pub settlement_reference: String,
    pub confirmed_at: DateTime<Utc>,
}

/// One journaled leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub intent: SettlementIntent,
    pub status: LegStatus,
    /// Gateway calls made so far.
    pub attempts: u32,
    pub receipt: Option<SettlementReceipt>,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What abandoning a batch did to its legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Abandoned {
    /// Legs in the batch.
    pub legs: usize,
    /// Open legs cancelled.
    pub voided: usize,
    /// Confirmed legs marked orphaned.
    pub orphaned: usize,
}

/// Thread-safe in-memory intent journal.
#[derive(Debug, Default)]
pub struct IntentJournal {
    entries: RwLock<HashMap<IntentId, JournalEntry>>,
}

impl IntentJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `intent` as pending. An existing entry is left untouched and
    /// returned instead.
    pub fn record(&self, intent: &SettlementIntent, now: DateTime<Utc>) -> JournalEntry {
        self.entries
            .write()
            .entry(intent.intent_id)
            .or_insert_with(|| JournalEntry {
                intent: intent.clone(),
                status: LegStatus::Pending,
                attempts: 0,
                receipt: None,
                last_error: None,
                recorded_at: now,
                updated_at: now,
            })
            .clone()
    }

    /// Put back entries loaded from durable storage.
    pub fn restore(&self, entries: impl IntoIterator<Item = JournalEntry>) {
        let mut map = self.entries.write();
        for entry in entries {
            map.insert(entry.intent.intent_id, entry);
        }
    }

    /// Look up one leg.
    pub fn get(&self, id: &IntentId) -> Option<JournalEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Apply `f` to an entry and return the updated copy.
    pub fn update<F>(&self, id: &IntentId, now: DateTime<Utc>, f: F) -> Option<JournalEntry>
    where
        F: FnOnce(&mut JournalEntry),
    {
        let mut map = self.entries.write();
        let entry = map.get_mut(id)?;
        f(entry);
        entry.updated_at = now;
        Some(entry.clone())
    }

    /// Apply `f` only while the entry's status is one of `from`, under a
    /// single write lock. `Err` carries the entry as found otherwise.
    pub fn transition<F>(
        &self,
        id: &IntentId,
        now: DateTime<Utc>,
        from: &[LegStatus],
        f: F,
    ) -> Option<Result<JournalEntry, JournalEntry>>
    where
        F: FnOnce(&mut JournalEntry),
    {
        let mut map = self.entries.write();
        let entry = map.get_mut(id)?;
        if !from.contains(&entry.status) {
            return Some(Err(entry.clone()));
        }
        f(entry);
        entry.updated_at = now;
        Some(Ok(entry.clone()))
    }

    /// Void every open leg of a batch. Returns how many were voided.
    pub fn void_open(&self, batch_id: &BatchId, now: DateTime<Utc>) -> usize {
        let mut map = self.entries.write();
        let mut voided = 0;
        for entry in map
            .values_mut()
            .filter(|e| e.intent.batch_id == *batch_id && e.status.is_open())
        {
            entry.status = LegStatus::Voided;
            entry.updated_at = now;
            voided += 1;
        }
        voided
    }

    /// Abandon a batch in one step: open legs are voided and confirmed legs
    /// become orphaned.
    pub fn abandon(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Abandoned {
        let mut map = self.entries.write();
        let mut report = Abandoned::default();
        for entry in map.values_mut().filter(|e| e.intent.batch_id == *batch_id) {
            report.legs += 1;
            let next = match entry.status {
                LegStatus::Pending | LegStatus::Stalled => {
                    report.voided += 1;
                    LegStatus::Voided
                }
                LegStatus::Confirmed => {
                    report.orphaned += 1;
                    LegStatus::Orphaned
                }
                _ => continue,
            };
            entry.status = next;
            entry.updated_at = now;
        }
        report
    }

    /// Every leg of a batch, in recording order.
    pub fn batch(&self, batch_id: &BatchId) -> Vec<JournalEntry> {
        let mut legs: Vec<JournalEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.intent.batch_id == *batch_id)
            .cloned()
            .collect();
        legs.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.intent.intent_id.cmp(&b.intent.intent_id))
        });
        legs
    }

    /// Legs in a given status.
    pub fn with_status(&self, status: LegStatus) -> Vec<JournalEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Number of journaled legs.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Party;
    use gig_core::{Amount, JobId, MilestoneId, UserId};
    use gig_state::IntentKind;

    fn leg(batch: BatchId) -> SettlementIntent {
        SettlementIntent {
            intent_id: IntentId::new(),
            batch_id: batch,
            kind: IntentKind::Release,
            amount: Amount::from_major(5).unwrap(),
            from_party: Party::Escrow,
            to_party: Party::Freelancer(UserId::new()),
            milestone_id: MilestoneId::new(),
            job_id: JobId::new(),
        }
    }

    #[test]
    fn record_is_idempotent() {
        let journal = IntentJournal::new();
        let l = leg(BatchId::new());
        journal.record(&l, Utc::now());
        journal.update(&l.intent_id, Utc::now(), |e| e.status = LegStatus::Confirmed);
        let again = journal.record(&l, Utc::now());
        assert_eq!(again.status, LegStatus::Confirmed);
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn batch_groups_legs() {
        let journal = IntentJournal::new();
        let b = BatchId::new();
        journal.record(&leg(b), Utc::now());
        journal.record(&leg(b), Utc::now());
        journal.record(&leg(BatchId::new()), Utc::now());
        assert_eq!(journal.batch(&b).len(), 2);
        assert_eq!(journal.with_status(LegStatus::Pending).len(), 3);
    }

    #[test]
    fn transition_only_applies_from_listed_statuses() {
        let journal = IntentJournal::new();
        let l = leg(BatchId::new());
        journal.record(&l, Utc::now());
        journal.update(&l.intent_id, Utc::now(), |e| e.status = LegStatus::Voided);

        let refused = journal
            .transition(&l.intent_id, Utc::now(), &[LegStatus::Pending], |e| {
                e.status = LegStatus::Confirmed
            })
            .unwrap();
        assert_eq!(refused.unwrap_err().status, LegStatus::Voided);
        assert_eq!(journal.get(&l.intent_id).unwrap().status, LegStatus::Voided);

        let applied = journal
            .transition(&l.intent_id, Utc::now(), &[LegStatus::Voided], |e| {
                e.status = LegStatus::Orphaned
            })
            .unwrap();
        assert_eq!(applied.unwrap().status, LegStatus::Orphaned);
    }

    #[test]
    fn abandon_voids_open_legs_and_orphans_confirmed_ones() {
        let journal = IntentJournal::new();
        let b = BatchId::new();
        let (paid, open, refused) = (leg(b), leg(b), leg(b));
        for l in [&paid, &open, &refused] {
            journal.record(l, Utc::now());
        }
        journal.update(&paid.intent_id, Utc::now(), |e| e.status = LegStatus::Confirmed);
        journal.update(&refused.intent_id, Utc::now(), |e| e.status = LegStatus::Failed);

        let report = journal.abandon(&b, Utc::now());
        assert_eq!(
            report,
            Abandoned {
                legs: 3,
                voided: 1,
                orphaned: 1
            }
        );
        assert_eq!(journal.get(&paid.intent_id).unwrap().status, LegStatus::Orphaned);
        assert_eq!(journal.get(&open.intent_id).unwrap().status, LegStatus::Voided);
        assert_eq!(journal.get(&refused.intent_id).unwrap().status, LegStatus::Failed);
        assert_eq!(journal.void_open(&b, Utc::now()), 0);
    }

    #[test]
    fn update_unknown_is_none() {
        let journal = IntentJournal::new();
        assert!(journal
            .update(&IntentId::new(), Utc::now(), |e| e.attempts += 1)
            .is_none());
    }
}
