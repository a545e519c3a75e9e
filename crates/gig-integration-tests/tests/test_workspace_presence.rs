//! Workspace presence around a live job: only the parties (and arbiters)
//! get in, and silent sessions time out and are purged by the reaper
//! without touching escrow state.

mod common;

use chrono::Utc;
use common::Scenario;
use gig_api::auth::CallerIdentity;
use gig_api::error::AppError;
use gig_core::{RejectionCode, UserId};
use gig_presence::{ReapReport, SessionStatus};
use gig_state::MilestoneStatus;

#[tokio::test]
async fn parties_share_the_workspace_until_the_reaper_clears_it() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[400]).await;
    let tracker = s.market.workspaces();
    let config = tracker.config();

    let client = s.market.join_workspace(&s.client(), job.id).unwrap();
    let freelancer = s.market.join_workspace(&s.freelancer(), job.id).unwrap();
    s.market.join_workspace(&s.arbiter(), job.id).unwrap();
    assert_eq!(s.market.workspace_participants(&s.client(), job.id).unwrap().len(), 3);

    let outsider = CallerIdentity::member(UserId::new());
    match s.market.join_workspace(&outsider, job.id) {
        Err(AppError::Rejected(r)) => assert_eq!(r.code(), RejectionCode::Forbidden),
        other => panic!("expected a forbidden rejection, got {other:?}"),
    }

    let tabbed = s
        .market
        .heartbeat_workspace(&s.freelancer(), freelancer.id, Some("deliveries".into()))
        .unwrap();
    assert_eq!(tabbed.active_tab.as_deref(), Some("deliveries"));
    assert!(s.market.leave_workspace(&s.freelancer(), client.id).is_err());

    let left = s.market.leave_workspace(&s.client(), client.id).unwrap();
    assert_eq!(left.status, SessionStatus::Disconnected);

    let silent = Utc::now() + config.timeout + chrono::Duration::minutes(1);
    let first = tracker.reap(silent);
    assert_eq!(first.disconnected, 2);
    assert!(s.market.workspace_participants(&s.client(), job.id).unwrap().is_empty());

    let second = tracker.reap(silent + config.retention + chrono::Duration::minutes(1));
    assert_eq!(second.purged, 3);
    assert_eq!(tracker.reap(silent + config.retention * 2), ReapReport::default());
    assert!(tracker.is_empty());

    // Presence never reaches escrow state.
    assert_eq!(s.market.milestone(ms[0].id).unwrap().status, MilestoneStatus::Pending);
}
