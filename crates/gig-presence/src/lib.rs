//! # gig-presence: Workspace Session Tracker
//!
//! Who is currently looking at a job's workspace. Sessions are ephemeral:
//! they live in memory only, time out after a period without heartbeats,
//! and are purged once disconnected for longer than the retention window.
//! Nothing here touches escrow or job state.
//!
//! Authorization (only the job's client, its freelancer, or an arbiter may
//! join) is checked by the caller before [`WorkspaceTracker::join`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gig_core::{EntityKind, JobId, Rejection, SessionId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// No such session (never existed or already purged).
    #[error("workspace session {0} not found")]
    UnknownSession(SessionId),
    /// The session timed out or was left; join again.
    #[error("workspace session {0} is disconnected")]
    Disconnected(SessionId),
}

impl From<PresenceError> for Rejection {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::UnknownSession(id) => Rejection::not_found(EntityKind::Session, id),
            PresenceError::Disconnected(_) => Rejection::invalid(
                EntityKind::Session,
                SessionStatus::Disconnected,
                "heartbeat",
                "session is disconnected; join again",
            ),
        }
    }
}

/// Liveness of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Disconnected,
}

impl SessionStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's presence in one job workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSession {
    pub id: SessionId,
    pub job_id: JobId,
    pub user_id: UserId,
    pub status: SessionStatus,
    /// UI tab last reported by a heartbeat.
    pub active_tab: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Timeouts for the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Silence after which an active session is disconnected.
    pub timeout: Duration,
    /// How long a disconnected session is kept before purging.
    pub retention: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::minutes(5),
            retention: Duration::hours(1),
        }
    }
}

/// Counts from one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Active sessions that timed out.
    pub disconnected: usize,
    /// Disconnected sessions removed.
    pub purged: usize,
}

/// Concurrent session registry keyed by session id, with a (job, user)
/// index enforcing one live session per pair.
#[derive(Debug, Default)]
pub struct WorkspaceTracker {
    sessions: DashMap<SessionId, WorkspaceSession>,
    by_member: DashMap<(JobId, UserId), SessionId>,
    config: PresenceConfig,
}

impl WorkspaceTracker {
    /// Tracker with the given timeouts.
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_member: DashMap::new(),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    /// Enter a workspace. Joining twice returns the same session, which is
    /// reactivated if it had disconnected.
    pub fn join(&self, job_id: JobId, user_id: UserId, now: DateTime<Utc>) -> WorkspaceSession {
        // Lock order: member index, then sessions.
        match self.by_member.entry((job_id, user_id)) {
            Entry::Occupied(slot) => {
                let id = *slot.get();
                if let Some(mut session) = self.sessions.get_mut(&id) {
                    session.status = SessionStatus::Active;
                    session.disconnected_at = None;
                    session.last_activity = now;
                    return session.clone();
                }
                let session = Self::fresh(id, job_id, user_id, now);
                self.sessions.insert(id, session.clone());
                session
            }
            Entry::Vacant(slot) => {
                let id = SessionId::new();
                let session = Self::fresh(id, job_id, user_id, now);
                self.sessions.insert(id, session.clone());
                slot.insert(id);
                tracing::debug!(job_id = %job_id, user_id = %user_id, session_id = %id, "workspace joined");
                session
            }
        }
    }

    fn fresh(id: SessionId, job_id: JobId, user_id: UserId, now: DateTime<Utc>) -> WorkspaceSession {
        WorkspaceSession {
            id,
            job_id,
            user_id,
            status: SessionStatus::Active,
            active_tab: None,
            joined_at: now,
            last_activity: now,
            disconnected_at: None,
        }
    }

    /// Record activity, optionally switching the active tab.
    pub fn heartbeat(
        &self,
        session_id: SessionId,
        tab: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceSession, PresenceError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(PresenceError::UnknownSession(session_id))?;
        if session.status == SessionStatus::Disconnected {
            return Err(PresenceError::Disconnected(session_id));
        }
        session.last_activity = now;
        if tab.is_some() {
            session.active_tab = tab;
        }
        Ok(session.clone())
    }

    /// Leave a workspace. Leaving twice is a no-op.
    pub fn leave(&self, session_id: SessionId, now: DateTime<Utc>) -> Result<WorkspaceSession, PresenceError> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(PresenceError::UnknownSession(session_id))?;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Disconnected;
            session.disconnected_at = Some(now);
        }
        Ok(session.clone())
    }

    /// Look up a session.
    pub fn get(&self, session_id: &SessionId) -> Option<WorkspaceSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Active sessions of a job, earliest joiner first.
    pub fn participants(&self, job_id: JobId) -> Vec<WorkspaceSession> {
        let mut active: Vec<WorkspaceSession> = self
            .sessions
            .iter()
            .filter(|s| s.job_id == job_id && s.status == SessionStatus::Active)
            .map(|s| s.clone())
            .collect();
        active.sort_by_key(|s| s.joined_at);
        active
    }

    /// Disconnect timed-out sessions and purge expired ones.
    pub fn reap(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            let mut purge = None;
            if let Some(mut session) = self.sessions.get_mut(&id) {
                match session.status {
                    SessionStatus::Active if now - session.last_activity > self.config.timeout => {
                        session.status = SessionStatus::Disconnected;
                        session.disconnected_at = Some(now);
                        report.disconnected += 1;
                    }
                    SessionStatus::Disconnected if self.purgeable(&session, now) => {
                        purge = Some((session.job_id, session.user_id));
                    }
                    _ => {}
                }
            }
            if let Some(member) = purge {
                // Guard dropped above; take the index first, as join does, and
                // hold it so a rejoin cannot reactivate the session meanwhile.
                let expired = |_: &SessionId, s: &WorkspaceSession| self.purgeable(s, now);
                let purged = match self.by_member.entry(member) {
                    Entry::Occupied(slot) => {
                        let purged = self.sessions.remove_if(&id, expired).is_some();
                        if purged && *slot.get() == id {
                            slot.remove();
                        }
                        purged
                    }
                    Entry::Vacant(_) => self.sessions.remove_if(&id, expired).is_some(),
                };
                if purged {
                    report.purged += 1;
                }
            }
        }
        if report.disconnected > 0 || report.purged > 0 {
            tracing::debug!(
                disconnected = report.disconnected,
                purged = report.purged,
                "workspace reaper pass"
            );
        }
        report
    }

    fn purgeable(&self, session: &WorkspaceSession, now: DateTime<Utc>) -> bool {
        session.status == SessionStatus::Disconnected
            && session
                .disconnected_at
                .is_some_and(|at| now - at > self.config.retention)
    }

    /// Number of tracked sessions, including disconnected ones.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Run [`WorkspaceTracker::reap`] every `interval` until the task is aborted.
pub fn spawn_reaper(tracker: Arc<WorkspaceTracker>, interval: StdDuration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tracker.reap(Utc::now());
        }
    })
}
