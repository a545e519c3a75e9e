//! Deadline sweep and reputation scenarios: expiry is applied once no
//! matter how many sweeps overlap, and reputation derived from the same
//! history is always the same record.

mod common;

use chrono::{Duration, Utc};
use common::{major, Scenario};
use gig_api::auth::CallerIdentity;
use gig_core::EventKind;
use gig_reputation::ReputationRole;
use gig_state::{JobStatus, MilestoneStatus, NewJob, NewMilestone};

#[tokio::test]
async fn repeated_sweeps_cancel_an_expired_job_once() {
    let s = Scenario::new();
    let job = s
        .market
        .create_job(
            &s.client(),
            NewJob {
                bidding_closes_at: Some(Utc::now() + Duration::hours(1)),
                ..s.new_job()
            },
        )
        .await
        .unwrap();

    let early = s.market.sweep_expired(Utc::now()).await;
    assert_eq!(early.cancelled_count, 0);

    let later = Utc::now() + Duration::hours(2);
    let first = s.market.sweep_expired(later).await;
    let second = s.market.sweep_expired(later).await;

    assert_eq!(first.cancelled_jobs, vec![job.id]);
    assert!(second.cancelled_jobs.is_empty());
    assert_eq!(s.market.job(job.id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(s.events.count(EventKind::JobCancelled), 1);
}

#[tokio::test]
async fn concurrent_sweeps_emit_one_cancellation() {
    let s = Scenario::new();
    let (job, _) = s.assigned_job(&[500]).await;
    let past_deadline = Utc::now() + Duration::hours(73);

    let (a, b) = tokio::join!(
        s.market.sweep_expired(past_deadline),
        s.market.sweep_expired(past_deadline)
    );

    assert_eq!(a.cancelled_jobs.len() + b.cancelled_jobs.len(), 1);
    let job = s.market.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.freelancer, None);
    assert_eq!(s.events.count(EventKind::JobCancelled), 1);
}

#[tokio::test]
async fn sweep_cancels_only_the_milestone_past_its_funding_date() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[600]).await;
    s.market.fund_milestone(&s.client(), ms[0].id, None).await.unwrap();
    let late = s
        .market
        .add_milestone(
            &s.client(),
            job.id,
            NewMilestone {
                title: "Extra revisions".into(),
                description: "Optional".into(),
                amount: major(100),
                fund_by: Some(Utc::now() + Duration::hours(1)),
            },
        )
        .await
        .unwrap();

    let report = s.market.sweep_expired(Utc::now() + Duration::hours(2)).await;
    assert_eq!(report.cancelled_milestones, vec![late.id]);
    assert_eq!(s.market.milestone(late.id).unwrap().status, MilestoneStatus::Cancelled);
    assert_eq!(s.market.milestone(ms[0].id).unwrap().status, MilestoneStatus::Funded);
    assert_ne!(s.market.job(job.id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn reputation_resync_is_bit_identical() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[800]).await;
    s.submitted(ms[0].id).await;
    s.market
        .approve_milestone(&s.client(), ms[0].id, None, None)
        .await
        .unwrap();
    s.market
        .submit_review(&s.client(), job.id, 5, "Clear communication".into())
        .await
        .unwrap();

    let first = s.market.sync_reputation(&s.freelancer(), s.freelancer).await.unwrap();
    let second = s
        .market
        .sync_reputation(&CallerIdentity::system(), s.freelancer)
        .await
        .unwrap();

    let a = first.freelancer_reputation.expect("freelancer record");
    let b = second.freelancer_reputation.expect("freelancer record");
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_vec(&a).unwrap(),
        serde_json::to_vec(&b).unwrap()
    );
    assert_eq!(a.role, ReputationRole::Freelancer);
    assert_eq!(a.completed_jobs, 1);
    assert_eq!(a.review_count, 1);
    assert_eq!(second.nfts_minted, 0);
    assert_eq!(second.achievements_awarded, 0);

    let integrity = s.market.verify_reputation(s.freelancer).unwrap();
    assert!(integrity.is_valid);
}

#[tokio::test]
async fn someone_else_cannot_resync_a_users_reputation() {
    let s = Scenario::new();
    let err = s
        .market
        .sync_reputation(&s.client(), s.freelancer)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn decay_applies_once_per_day() {
    let s = Scenario::new();
    let (_, ms) = s.assigned_job(&[300]).await;
    s.submitted(ms[0].id).await;
    s.market
        .approve_milestone(&s.client(), ms[0].id, None, None)
        .await
        .unwrap();
    s.market.sync_reputation(&s.freelancer(), s.freelancer).await.unwrap();

    let system = CallerIdentity::system();
    let much_later = Utc::now() + Duration::days(200);
    let first = s.market.apply_decay(&system, much_later).await.unwrap();
    let second = s.market.apply_decay(&system, much_later).await.unwrap();

    assert!(first.decayed >= 1);
    assert_eq!(second.decayed, 0);

    let profile = s.market.reputation_of(s.freelancer).unwrap();
    let record = profile.freelancer.expect("freelancer record");
    assert!(record.decay_adjusted_score <= record.score);

    assert_eq!(
        s.market.apply_decay(&s.client(), much_later).await.unwrap_err().code(),
        "FORBIDDEN"
    );
}
