//! Fixtures shared by the cross-crate scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gig_api::auth::CallerIdentity;
use gig_api::orchestration::milestones::Submission;
use gig_api::orchestration::Marketplace;
use gig_core::{Amount, RecordingPublisher, UserId};
use gig_escrow::{MockSettlementGateway, RetryPolicy};
use gig_state::{BudgetBounds, Job, Milestone, NewBid, NewJob, NewMilestone};

pub struct Scenario {
    pub market: Arc<Marketplace>,
    pub gateway: Arc<MockSettlementGateway>,
    pub events: Arc<RecordingPublisher>,
    pub client: UserId,
    pub freelancer: UserId,
    pub arbiter: UserId,
}

pub fn major(n: i64) -> Amount {
    Amount::from_major(n).unwrap()
}

impl Scenario {
    pub fn new() -> Self {
        let gateway = Arc::new(MockSettlementGateway::new());
        let events = Arc::new(RecordingPublisher::new());
        let market = Marketplace::builder(gateway.clone())
            .publisher(events.clone())
            .retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .build()
            .unwrap();
        Self {
            market: Arc::new(market),
            gateway,
            events,
            client: UserId::new(),
            freelancer: UserId::new(),
            arbiter: UserId::new(),
        }
    }

    pub fn client(&self) -> CallerIdentity {
        CallerIdentity::member(self.client)
    }

    pub fn freelancer(&self) -> CallerIdentity {
        CallerIdentity::member(self.freelancer)
    }

    pub fn arbiter(&self) -> CallerIdentity {
        CallerIdentity::arbiter(self.arbiter)
    }

    pub fn new_job(&self) -> NewJob {
        NewJob {
            title: "Checkout redesign".into(),
            description: "Three screens and a style guide".into(),
            category: "design".into(),
            budget: BudgetBounds::new(major(100), major(10_000)).unwrap(),
            currency: "USD".into(),
            bidding_closes_at: None,
        }
    }

    /// An open job with a freelancer bid of `total`, not yet accepted.
    pub async fn open_job_with_bid(&self, total: i64) -> (Job, gig_state::Bid) {
        let job = self.market.create_job(&self.client(), self.new_job()).await.unwrap();
        let bid = self
            .market
            .place_bid(
                &self.freelancer(),
                job.id,
                NewBid {
                    amount: major(total),
                    delivery_days: 21,
                    cover_note: "Portfolio attached".into(),
                },
            )
            .await
            .unwrap();
        (job, bid)
    }

    /// A job assigned to `self.freelancer` with one milestone per amount.
    pub async fn assigned_job(&self, amounts: &[i64]) -> (Job, Vec<Milestone>) {
        let (job, bid) = self.open_job_with_bid(amounts.iter().sum()).await;
        self.market
            .accept_bid(&self.client(), job.id, bid.id, None)
            .await
            .unwrap();
        let mut milestones = Vec::new();
        for (i, amount) in amounts.iter().enumerate() {
            let m = self
                .market
                .add_milestone(
                    &self.client(),
                    job.id,
                    NewMilestone {
                        title: format!("Milestone {}", i + 1),
                        description: "Deliverables as agreed".into(),
                        amount: major(*amount),
                        fund_by: None,
                    },
                )
                .await
                .unwrap();
            milestones.push(m);
        }
        (self.market.job(job.id).unwrap(), milestones)
    }

    /// Fund, start and submit a milestone; returns it in `submitted`.
    pub async fn submitted(&self, milestone: gig_core::MilestoneId) -> Milestone {
        self.market.fund_milestone(&self.client(), milestone, None).await.unwrap();
        self.market
            .start_milestone(&self.freelancer(), milestone, None)
            .await
            .unwrap();
        self.market
            .submit_milestone(
                &self.freelancer(),
                milestone,
                Submission {
                    reference: Some("https://files.example.com/handoff.zip".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap()
    }
}
