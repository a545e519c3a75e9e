//! The reputation sync service: the only writer of reputation records.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gig_core::event::{publish_all, DomainEvent, EventKind, EventPublisher};
use gig_core::UserId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReputationError;
use crate::model::{Achievement, Badge, ReputationRecord, ReputationRole};
use crate::score;
use crate::store::{ReputationHistory, ReputationStore};

/// Tuning for decay and batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationConfig {
    /// Whole days without activity before decay applies.
    pub inactivity_days: i64,
    /// Days for the adjusted score to halve.
    pub half_life_days: u32,
    /// Records processed per decay batch.
    pub batch_size: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            inactivity_days: 90,
            half_life_days: 180,
            batch_size: 100,
        }
    }
}

/// Result of a full resync for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub user_id: UserId,
    pub freelancer_reputation: Option<ReputationRecord>,
    pub client_reputation: Option<ReputationRecord>,
    /// Badges reached for the first time in this run.
    pub nfts_minted: u32,
    /// Achievements earned for the first time in this run.
    pub achievements_awarded: u32,
}

/// Result of a decay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecayReport {
    pub examined: usize,
    pub decayed: usize,
    pub batches: usize,
}

/// Result of an integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub user_id: UserId,
    pub is_valid: bool,
    pub issues: Vec<String>,
}

/// Recomputes, decays and verifies reputation records.
///
/// Every read-modify-write of a user's records runs under that user's lock,
/// so a resync and a decay pass never overwrite each other.
pub struct ReputationService {
    history: Arc<dyn ReputationHistory>,
    store: Arc<dyn ReputationStore>,
    publisher: Arc<dyn EventPublisher>,
    config: ReputationConfig,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ReputationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReputationService {
    pub fn new(
        history: Arc<dyn ReputationHistory>,
        store: Arc<dyn ReputationStore>,
        publisher: Arc<dyn EventPublisher>,
        config: ReputationConfig,
    ) -> Self {
        Self {
            history,
            store,
            publisher,
            config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user: UserId) -> Arc<Mutex<()>> {
        self.locks.entry(user).or_default().clone()
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Stored record for `(user, role)`.
    pub fn record(
        &self,
        user: UserId,
        role: ReputationRole,
    ) -> Result<Option<ReputationRecord>, ReputationError> {
        self.store.get(user, role)
    }

    /// Recompute both role records for `user` from the full history.
    ///
    /// Running twice without new history writes identical records and
    /// reports nothing new.
    pub fn sync_user_reputation(&self, user: UserId) -> Result<SyncReport, ReputationError> {
        let lock = self.lock_for(user);
        let _guard = lock.lock();
        let events = self.history.events_for(user)?;
        let mut report = SyncReport {
            user_id: user,
            freelancer_reputation: None,
            client_reputation: None,
            nfts_minted: 0,
            achievements_awarded: 0,
        };
        let mut announcements = Vec::new();

        for role in ReputationRole::ALL {
            let Some(fresh) = score::compute(user, role, &events) else {
                continue;
            };
            let existing = self.store.get(user, role)?;
            let (record, new_badges, new_achievements) = merge(fresh, existing.as_ref());

            report.nfts_minted += new_badges.len() as u32;
            report.achievements_awarded += new_achievements.len() as u32;
            for badge in &new_badges {
                announcements.push(badge_event(&record, *badge));
            }

            if existing.as_ref() != Some(&record) {
                self.store.upsert(record.clone())?;
            }
            match role {
                ReputationRole::Freelancer => report.freelancer_reputation = Some(record),
                ReputationRole::Client => report.client_reputation = Some(record),
            }
        }

        publish_all(self.publisher.as_ref(), &announcements);
        tracing::info!(
            user_id = %user,
            nfts_minted = report.nfts_minted,
            achievements_awarded = report.achievements_awarded,
            "reputation synced"
        );
        Ok(report)
    }

    /// Apply time decay to inactive records, at most once per UTC day.
    pub fn apply_reputation_decay(&self, as_of: DateTime<Utc>) -> Result<DecayReport, ReputationError> {
        let period = as_of.date_naive();
        let records = self.store.all()?;
        let mut report = DecayReport::default();

        for batch in records.chunks(self.config.batch_size.max(1)) {
            report.batches += 1;
            for scanned in batch {
                report.examined += 1;
                if !self.due_for_decay(scanned, as_of) {
                    continue;
                }
                let lock = self.lock_for(scanned.user_id);
                let _guard = lock.lock();
                // A resync may have landed since the scan.
                let Some(record) = self.store.get(scanned.user_id, scanned.role)? else {
                    continue;
                };
                if !self.due_for_decay(&record, as_of) {
                    continue;
                }
                let days_inactive = (as_of - record.last_updated).num_days();
                let mut next = record.clone();
                next.decay_adjusted_score =
                    score::decayed(record.score, days_inactive, self.config.half_life_days);
                next.last_decay_period = Some(period);
                self.store.upsert(next)?;
                report.decayed += 1;
            }
            tracing::debug!(batch = report.batches, size = batch.len(), "decay batch processed");
        }

        tracing::info!(
            examined = report.examined,
            decayed = report.decayed,
            period = %period,
            "reputation decay applied"
        );
        Ok(report)
    }

    fn due_for_decay(&self, record: &ReputationRecord, as_of: DateTime<Utc>) -> bool {
        (as_of - record.last_updated).num_days() > self.config.inactivity_days
            && record.last_decay_period != Some(as_of.date_naive())
    }

    /// Recompute independently and diff against the stored records.
    pub fn verify_reputation_integrity(&self, user: UserId) -> Result<IntegrityReport, ReputationError> {
        let events = self.history.events_for(user)?;
        let mut issues = Vec::new();

        for role in ReputationRole::ALL {
            let expected = score::compute(user, role, &events);
            let stored = self.store.get(user, role)?;
            match (expected, stored) {
                (None, None) => {}
                (Some(_), None) => issues.push(format!("{role}: record missing")),
                (None, Some(_)) => issues.push(format!("{role}: record exists without history")),
                (Some(e), Some(s)) => diff(role, &e, &s, &mut issues),
            }
        }

        if !issues.is_empty() {
            tracing::warn!(user_id = %user, issues = issues.len(), "reputation integrity check failed");
        }
        Ok(IntegrityReport {
            user_id: user,
            is_valid: issues.is_empty(),
            issues,
        })
    }
}

/// Fold a fresh computation into the stored record.
///
/// Earned badges and achievements are never revoked. Decay state survives
/// only while the contributing history is unchanged.
fn merge(
    mut fresh: ReputationRecord,
    existing: Option<&ReputationRecord>,
) -> (ReputationRecord, Vec<Badge>, Vec<Achievement>) {
    let Some(old) = existing else {
        let badges = fresh.badges.clone();
        let achievements = fresh.achievements.clone();
        return (fresh, badges, achievements);
    };

    let new_badges: Vec<Badge> = fresh
        .badges
        .iter()
        .filter(|b| !old.badges.contains(b))
        .copied()
        .collect();
    let new_achievements: Vec<Achievement> = fresh
        .achievements
        .iter()
        .filter(|a| !old.achievements.contains(a))
        .copied()
        .collect();

    fresh.badges = union(&old.badges, &fresh.badges);
    fresh.achievements = union(&old.achievements, &fresh.achievements);

    if old.last_updated == fresh.last_updated && old.score == fresh.score {
        fresh.decay_adjusted_score = old.decay_adjusted_score;
        fresh.last_decay_period = old.last_decay_period;
    }
    (fresh, new_badges, new_achievements)
}

fn union<T: Ord + Copy>(a: &[T], b: &[T]) -> Vec<T> {
    a.iter().chain(b).copied().collect::<BTreeSet<_>>().into_iter().collect()
}

fn diff(role: ReputationRole, expected: &ReputationRecord, stored: &ReputationRecord, issues: &mut Vec<String>) {
    let checks: [(&str, u32, u32); 5] = [
        ("score", expected.score, stored.score),
        ("review_count", expected.review_count, stored.review_count),
        ("average_rating", expected.average_rating, stored.average_rating),
        ("completed_jobs", expected.completed_jobs, stored.completed_jobs),
        ("failed_jobs", expected.failed_jobs, stored.failed_jobs),
    ];
    for (field, want, have) in checks {
        if want != have {
            issues.push(format!("{role}: {field} is {have}, expected {want}"));
        }
    }
    if expected.last_updated != stored.last_updated {
        issues.push(format!("{role}: last_updated is stale"));
    }
    if stored.decay_adjusted_score > stored.score {
        issues.push(format!("{role}: decay-adjusted score exceeds base score"));
    }
    for badge in &expected.badges {
        if !stored.badges.contains(badge) {
            issues.push(format!("{role}: badge {} missing", badge.as_str()));
        }
    }
    for achievement in &expected.achievements {
        if !stored.achievements.contains(achievement) {
            issues.push(format!("{role}: achievement {} missing", achievement.as_str()));
        }
    }
}

fn badge_event(record: &ReputationRecord, badge: Badge) -> DomainEvent {
    DomainEvent::new(
        EventKind::ReputationBadgeEarned,
        record.user_id,
        record.last_updated,
        vec![record.user_id],
    )
    .with_payload(serde_json::json!({
        "role": record.role.as_str(),
        "badge": badge.as_str(),
        "completed_jobs": record.completed_jobs,
    }))
}
