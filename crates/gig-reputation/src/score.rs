//! Pure scoring functions. Every output is a function of the history alone,
//! so recomputing twice gives bit-identical records.

use chrono::{DateTime, Utc};
use gig_core::UserId;

use crate::model::{Achievement, Badge, HistoryEvent, ReputationRecord, ReputationRole};

const BPS: u64 = 10_000;

/// Aggregated counts for one role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub reviews: u32,
    pub rating_sum: u64,
    pub completed: u32,
    pub failed: u32,
    pub newest: Option<DateTime<Utc>>,
}

impl Tally {
    /// Fold the events for `role`.
    pub fn of(events: &[HistoryEvent], role: ReputationRole) -> Tally {
        let mut t = Tally::default();
        for event in events.iter().filter(|e| e.role() == role) {
            match event {
                HistoryEvent::ReviewReceived { rating, .. } => {
                    t.reviews += 1;
                    t.rating_sum += u64::from((*rating).clamp(1, 5));
                }
                HistoryEvent::JobCompleted { .. } => t.completed += 1,
                HistoryEvent::JobFailed { .. } => t.failed += 1,
            }
            t.newest = t.newest.max(Some(event.at()));
        }
        t
    }

    /// `(Σrating − n)·10000 / (4n)`, or `None` without reviews.
    pub fn rating_component(&self) -> Option<u32> {
        if self.reviews == 0 {
            return None;
        }
        let n = u64::from(self.reviews);
        Some(((self.rating_sum - n) * BPS / (4 * n)) as u32)
    }

    /// `completed·10000 / (completed + failed)`.
    pub fn completion_component(&self) -> u32 {
        let total = u64::from(self.completed) + u64::from(self.failed);
        if total == 0 {
            return 0;
        }
        (u64::from(self.completed) * BPS / total) as u32
    }

    /// Weighted score: 70% rating, 30% completion, or completion alone.
    pub fn score(&self) -> u32 {
        let completion = u64::from(self.completion_component());
        match self.rating_component() {
            Some(rating) => ((7 * u64::from(rating) + 3 * completion) / 10) as u32,
            None => completion as u32,
        }
    }

    /// Mean rating in hundredths.
    pub fn average_rating(&self) -> u32 {
        if self.reviews == 0 {
            return 0;
        }
        (self.rating_sum * 100 / u64::from(self.reviews)) as u32
    }
}

/// Badges earned at `completed` jobs.
pub fn badges_for(completed: u32) -> Vec<Badge> {
    Badge::ALL
        .into_iter()
        .filter(|b| completed >= b.threshold())
        .collect()
}

/// Achievements implied by a tally.
pub fn achievements_for(t: &Tally) -> Vec<Achievement> {
    let mut out = Vec::new();
    if t.completed >= 1 {
        out.push(Achievement::FirstJob);
    }
    if t.reviews >= 5 && t.average_rating() >= 480 {
        out.push(Achievement::TopRated);
    }
    if t.completed >= 10 && t.failed == 0 {
        out.push(Achievement::Reliable);
    }
    if t.completed >= 25 {
        out.push(Achievement::Veteran);
    }
    out
}

/// Fresh record for `user` in `role`, or `None` with no history.
pub fn compute(user_id: UserId, role: ReputationRole, events: &[HistoryEvent]) -> Option<ReputationRecord> {
    let t = Tally::of(events, role);
    let last_updated = t.newest?;
    let score = t.score();
    Some(ReputationRecord {
        user_id,
        role,
        score,
        review_count: t.reviews,
        average_rating: t.average_rating(),
        completed_jobs: t.completed,
        failed_jobs: t.failed,
        last_updated,
        decay_adjusted_score: score,
        last_decay_period: None,
        badges: badges_for(t.completed),
        achievements: achievements_for(&t),
    })
}

/// `score × 0.5^(days / half_life)`, floored.
pub fn decayed(score: u32, days_inactive: i64, half_life_days: u32) -> u32 {
    if days_inactive <= 0 || half_life_days == 0 {
        return score;
    }
    let factor = 0.5_f64.powf(days_inactive as f64 / f64::from(half_life_days));
    (f64::from(score) * factor).floor() as u32
}
