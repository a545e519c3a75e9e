//! Reputation records, history events, badges and achievements.

use chrono::{DateTime, NaiveDate, Utc};
use gig_core::{JobId, UserId};
use serde::{Deserialize, Serialize};

/// Which side of a job the reputation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationRole {
    Freelancer,
    Client,
}

impl ReputationRole {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Freelancer => "freelancer",
            Self::Client => "client",
        }
    }

    /// Both roles, in record order.
    pub const ALL: [ReputationRole; 2] = [Self::Freelancer, Self::Client];
}

impl std::fmt::Display for ReputationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fact that feeds reputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    /// The user received a review while acting in `role`.
    ReviewReceived {
        job_id: JobId,
        role: ReputationRole,
        rating: u8,
        at: DateTime<Utc>,
    },
    /// A job the user took part in as `role` completed.
    JobCompleted {
        job_id: JobId,
        role: ReputationRole,
        at: DateTime<Utc>,
    },
    /// A job ended against the user: cancelled after assignment, or a
    /// dispute decided fully against them.
    JobFailed {
        job_id: JobId,
        role: ReputationRole,
        at: DateTime<Utc>,
    },
}

impl HistoryEvent {
    /// Role the event applies to.
    pub fn role(&self) -> ReputationRole {
        match self {
            Self::ReviewReceived { role, .. }
            | Self::JobCompleted { role, .. }
            | Self::JobFailed { role, .. } => *role,
        }
    }

    /// When it happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::ReviewReceived { at, .. } | Self::JobCompleted { at, .. } | Self::JobFailed { at, .. } => *at,
        }
    }
}

/// Completion tiers. Minting the matching token is external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Badge {
    /// Every tier, lowest first.
    pub const ALL: [Badge; 4] = [Self::Bronze, Self::Silver, Self::Gold, Self::Platinum];

    /// Completed jobs required.
    pub fn threshold(&self) -> u32 {
        match self {
            Self::Bronze => 1,
            Self::Silver => 10,
            Self::Gold => 50,
            Self::Platinum => 100,
        }
    }

    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
            Self::Platinum => "platinum",
        }
    }
}

/// Derived recognitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    /// First completed job.
    FirstJob,
    /// At least 5 reviews averaging 4.80 or better.
    TopRated,
    /// At least 10 completed jobs and no failures.
    Reliable,
    /// At least 25 completed jobs.
    Veteran,
}

impl Achievement {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstJob => "first_job",
            Self::TopRated => "top_rated",
            Self::Reliable => "reliable",
            Self::Veteran => "veteran",
        }
    }
}

/// Derived reputation of one user in one role.
///
/// `score` and `decay_adjusted_score` are basis points (0..=10000);
/// `average_rating` is in hundredths of a star.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub user_id: UserId,
    pub role: ReputationRole,
    pub score: u32,
    pub review_count: u32,
    pub average_rating: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    /// Timestamp of the newest contributing history event.
    pub last_updated: DateTime<Utc>,
    pub decay_adjusted_score: u32,
    /// UTC day of the last decay application.
    pub last_decay_period: Option<NaiveDate>,
    pub badges: Vec<Badge>,
    pub achievements: Vec<Achievement>,
}
