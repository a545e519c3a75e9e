//! Workspace presence. Sessions are ephemeral and never persisted.

use chrono::Utc;
use gig_core::{EntityKind, JobId, Rejection, Role, SessionId, UserId};
use gig_presence::WorkspaceSession;

use super::Marketplace;
use crate::auth::{CallerIdentity, CallerKind};
use crate::error::AppError;

impl Marketplace {
    /// Enter a job's workspace. Only the job's parties and arbiters may.
    pub fn join_workspace(&self, caller: &CallerIdentity, job_id: JobId) -> Result<WorkspaceSession, AppError> {
        let result = self.workspace_member(caller, job_id).map(|user| {
            let session = self.workspaces.join(job_id, user, Utc::now());
            tracing::debug!(job_id = %job_id, user_id = %user, session_id = %session.id, "workspace joined");
            session
        });
        self.observe("workspace", "join", result)
    }

    /// Keep a session alive, optionally reporting the active tab.
    pub fn heartbeat_workspace(
        &self,
        caller: &CallerIdentity,
        session_id: SessionId,
        tab: Option<String>,
    ) -> Result<WorkspaceSession, AppError> {
        let result = self
            .own_session(caller, session_id)
            .and_then(|_| self.workspaces.heartbeat(session_id, tab, Utc::now()).map_err(AppError::from));
        self.observe("workspace", "heartbeat", result)
    }

    pub fn leave_workspace(&self, caller: &CallerIdentity, session_id: SessionId) -> Result<WorkspaceSession, AppError> {
        let result = self
            .own_session(caller, session_id)
            .and_then(|_| self.workspaces.leave(session_id, Utc::now()).map_err(AppError::from));
        self.observe("workspace", "leave", result)
    }

    /// Active sessions in a job's workspace.
    pub fn workspace_participants(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
    ) -> Result<Vec<WorkspaceSession>, AppError> {
        self.workspace_member(caller, job_id)?;
        Ok(self.workspaces.participants(job_id))
    }

    fn workspace_member(&self, caller: &CallerIdentity, job_id: JobId) -> Result<UserId, AppError> {
        let user = caller.require_user()?;
        let job = self.jobs.require(job_id)?;
        let role = match caller.kind {
            CallerKind::Arbiter => return Ok(user),
            CallerKind::System => Role::System,
            CallerKind::Member => job.role_of(user),
        };
        match role {
            Role::Client | Role::Freelancer => Ok(user),
            other => Err(Rejection::forbidden("join workspace", other).into()),
        }
    }

    fn own_session(&self, caller: &CallerIdentity, session_id: SessionId) -> Result<WorkspaceSession, AppError> {
        let user = caller.require_user()?;
        let session = self
            .workspaces
            .get(&session_id)
            .ok_or_else(|| Rejection::not_found(EntityKind::Session, session_id))?;
        if session.user_id != user {
            return Err(AppError::Forbidden(format!(
                "workspace session {session_id} belongs to another user"
            )));
        }
        Ok(session)
    }
}
