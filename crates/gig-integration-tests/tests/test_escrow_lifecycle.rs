//! Escrow lifecycle scenarios across gig-state, gig-escrow, gig-arbitration
//! and the marketplace orchestration in gig-api.

mod common;

use std::sync::Arc;

use common::{major, Scenario};
use gig_api::error::AppError;
use gig_arbitration::ResolutionAction;
use gig_core::{Amount, EventKind, MilestoneId, RejectionCode};
use gig_escrow::{LegStatus, MockOutcome, Party};
use gig_state::{IntentKind, JobStatus, MilestoneStatus};

fn confirmed_payout_legs(s: &Scenario, milestone: MilestoneId) -> Vec<gig_escrow::JournalEntry> {
    s.market
        .escrow()
        .journal()
        .with_status(LegStatus::Confirmed)
        .into_iter()
        .filter(|e| e.intent.milestone_id == milestone && e.intent.kind != IntentKind::Fund)
        .collect()
}

fn rejection_code(err: AppError) -> RejectionCode {
    match err {
        AppError::Rejected(r) => r.code(),
        other => panic!("expected a domain rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn budget_of_1000_runs_from_posting_to_completed() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[1000]).await;
    assert_eq!(job.status, JobStatus::Assigned);
    assert_eq!(job.freelancer, Some(s.freelancer));

    let submitted = s.submitted(ms[0].id).await;
    assert_eq!(submitted.status, MilestoneStatus::Submitted);
    assert_eq!(s.market.job(job.id).unwrap().status, JobStatus::InProgress);

    let approved = s
        .market
        .approve_milestone(&s.client(), ms[0].id, Some("Ship it".into()), None)
        .await
        .unwrap();
    assert_eq!(approved.status, MilestoneStatus::Completed);
    assert!(!approved.settlement_stalled);

    let job = s.market.job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.freelancer, Some(s.freelancer));
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), major(1000));
    assert_eq!(s.events.count(EventKind::MilestoneCompleted), 1);
    assert_eq!(s.events.count(EventKind::JobCompleted), 1);

    let invoices = s.market.invoices_for(job.id).unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].net_to_freelancer, major(1000));
}

#[tokio::test]
async fn split_ruling_pays_600_and_400_through_disputed_resolved() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[1000]).await;
    s.submitted(ms[0].id).await;

    let dispute = s
        .market
        .raise_dispute(&s.client(), ms[0].id, "Half the screens are missing".into())
        .await
        .unwrap();
    s.market.claim_dispute(&s.arbiter(), dispute.id).await.unwrap();
    s.market
        .resolve_dispute(
            &s.arbiter(),
            dispute.id,
            ResolutionAction::Split {
                freelancer: major(600),
                client: major(400),
            },
            "Partial delivery accepted".into(),
        )
        .await
        .unwrap();

    let legs = confirmed_payout_legs(&s, ms[0].id);
    assert_eq!(legs.len(), 2);
    let total = legs
        .iter()
        .try_fold(Amount::ZERO, |acc, e| acc.checked_add(e.intent.amount))
        .unwrap();
    assert_eq!(total, major(1000));
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), major(600));
    assert_eq!(s.gateway.credited(Party::Client(s.client)), major(400));

    let m = s.market.milestone(ms[0].id).unwrap();
    assert_eq!(m.status, MilestoneStatus::Completed);
    let path: Vec<MilestoneStatus> = m.transition_log.iter().map(|r| r.to).collect();
    let resolved_at = path
        .iter()
        .position(|st| *st == MilestoneStatus::DisputedResolved)
        .expect("milestone passed through disputed_resolved");
    assert_eq!(path.last(), Some(&MilestoneStatus::Completed));
    assert!(resolved_at < path.len() - 1);

    assert_eq!(s.market.job(job.id).unwrap().status, JobStatus::Completed);
    assert_eq!(s.events.count(EventKind::DisputeResolved), 1);
}

#[tokio::test]
async fn concurrent_approvals_with_one_version_yield_one_winner() {
    let s = Scenario::new();
    let (_, ms) = s.assigned_job(&[750]).await;
    let submitted = s.submitted(ms[0].id).await;
    let version = submitted.version;

    let first = {
        let market = Arc::clone(&s.market);
        let caller = s.client();
        let id = ms[0].id;
        tokio::spawn(async move { market.approve_milestone(&caller, id, None, Some(version)).await })
    };
    let second = {
        let market = Arc::clone(&s.market);
        let caller = s.client();
        let id = ms[0].id;
        tokio::spawn(async move { market.approve_milestone(&caller, id, None, Some(version)).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, MilestoneStatus::Completed);

    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert_eq!(rejection_code(loser), RejectionCode::Conflict);

    assert_eq!(confirmed_payout_legs(&s, ms[0].id).len(), 1);
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), major(750));
}

#[tokio::test]
async fn lost_gateway_response_is_retried_without_double_credit() {
    let s = Scenario::new();
    let (_, ms) = s.assigned_job(&[1000]).await;
    s.submitted(ms[0].id).await;
    let dispatches_before = s.gateway.dispatch_count();

    s.gateway.script([MockOutcome::TransientAfterApply, MockOutcome::Transient]);
    let m = s
        .market
        .approve_milestone(&s.client(), ms[0].id, None, None)
        .await
        .unwrap();

    assert_eq!(m.status, MilestoneStatus::Completed);
    assert_eq!(s.gateway.dispatch_count() - dispatches_before, 3);
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), major(1000));

    let legs = confirmed_payout_legs(&s, ms[0].id);
    assert_eq!(legs.len(), 1);
    assert_eq!(legs[0].attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_stall_the_milestone_for_an_operator() {
    let s = Scenario::new();
    let (job, ms) = s.assigned_job(&[400]).await;
    s.submitted(ms[0].id).await;

    s.gateway
        .script([MockOutcome::Transient, MockOutcome::Transient, MockOutcome::Transient]);
    let m = s
        .market
        .approve_milestone(&s.client(), ms[0].id, None, None)
        .await
        .unwrap();
    assert_eq!(m.status, MilestoneStatus::Approved);
    assert!(m.settlement_stalled);
    assert_eq!(s.events.count(EventKind::SettlementStalled), 1);
    assert_eq!(s.market.job(job.id).unwrap().status, JobStatus::InProgress);

    let stalled = s.market.stalled_intents();
    assert_eq!(stalled.len(), 1);
    let update = s
        .market
        .retry_stalled(&gig_api::auth::CallerIdentity::system(), stalled[0].intent.intent_id)
        .await
        .unwrap();
    assert_eq!(update.milestone.status, MilestoneStatus::Completed);

    let m = s.market.milestone(ms[0].id).unwrap();
    assert_eq!(m.status, MilestoneStatus::Completed);
    assert!(!m.settlement_stalled);
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), major(400));
    assert_eq!(s.market.job(job.id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn permanent_refusal_rolls_the_approval_back() {
    let s = Scenario::new();
    let (_, ms) = s.assigned_job(&[300]).await;
    s.submitted(ms[0].id).await;

    s.gateway.script([MockOutcome::Permanent]);
    let m = s
        .market
        .approve_milestone(&s.client(), ms[0].id, None, None)
        .await
        .unwrap();

    assert_eq!(m.status, MilestoneStatus::Submitted);
    assert_eq!(m.pending_batch, None);
    assert_eq!(s.events.count(EventKind::SettlementFailed), 1);
    assert_eq!(s.gateway.credited(Party::Freelancer(s.freelancer)), Amount::ZERO);
}
