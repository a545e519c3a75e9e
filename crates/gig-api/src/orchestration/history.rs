//! Reputation history derived from the marketplace's own documents.
//!
//! Nothing is recorded separately: every sync reads reviews, job outcomes
//! and dispute rulings straight from the stores, so a resync always sees the
//! complete record and running it twice yields the same result.

use gig_arbitration::{Dispute, DisputeStatus, ResolutionAction};
use gig_core::{Role, UserId};
use gig_reputation::{HistoryEvent, ReputationError, ReputationHistory, ReputationRole};
use gig_state::{Bid, Job, JobStatus};

use crate::records::Review;
use crate::state::Store;

/// [`ReputationHistory`] over the live entity stores.
#[derive(Debug, Clone)]
pub struct MarketplaceHistory {
    jobs: Store<Job>,
    bids: Store<Bid>,
    disputes: Store<Dispute>,
    reviews: Store<Review>,
}

impl MarketplaceHistory {
    pub fn new(jobs: Store<Job>, bids: Store<Bid>, disputes: Store<Dispute>, reviews: Store<Review>) -> Self {
        Self {
            jobs,
            bids,
            disputes,
            reviews,
        }
    }

    /// Freelancer of record, surviving cancellation.
    fn freelancer_of(&self, job: &Job) -> Option<UserId> {
        job.freelancer.or_else(|| {
            job.accepted_bid
                .and_then(|id| self.bids.get(id))
                .map(|bid| bid.freelancer)
        })
    }
}

impl ReputationHistory for MarketplaceHistory {
    fn events_for(&self, user: UserId) -> Result<Vec<HistoryEvent>, ReputationError> {
        let mut events: Vec<HistoryEvent> = self
            .reviews
            .filter(|r| r.reviewee == user)
            .into_iter()
            .map(|r| HistoryEvent::ReviewReceived {
                job_id: r.job_id,
                role: r.reviewee_role,
                rating: r.rating,
                at: r.created_at,
            })
            .collect();

        for job in self.jobs.list() {
            let freelancer = self.freelancer_of(&job);
            let involved = job.client == user || freelancer == Some(user);
            if !involved {
                continue;
            }
            match job.status {
                JobStatus::Completed => {
                    let at = job.completed_at.unwrap_or(job.created_at);
                    if job.client == user {
                        events.push(HistoryEvent::JobCompleted {
                            job_id: job.id,
                            role: ReputationRole::Client,
                            at,
                        });
                    }
                    if freelancer == Some(user) {
                        events.push(HistoryEvent::JobCompleted {
                            job_id: job.id,
                            role: ReputationRole::Freelancer,
                            at,
                        });
                    }
                }
                // Walking away after assignment counts against the client,
                // whether they cancelled or let the funding deadline lapse.
                JobStatus::Cancelled if job.client == user && job.accepted_bid.is_some() => {
                    let cancelled_by = job
                        .transition_log
                        .iter()
                        .rev()
                        .find(|r| r.to == JobStatus::Cancelled)
                        .map(|r| r.actor.role);
                    if matches!(cancelled_by, Some(Role::Client | Role::System)) {
                        events.push(HistoryEvent::JobFailed {
                            job_id: job.id,
                            role: ReputationRole::Client,
                            at: job.cancelled_at.unwrap_or(job.created_at),
                        });
                    }
                }
                _ => {}
            }
        }

        for dispute in self
            .disputes
            .filter(|d| d.status == DisputeStatus::Resolved)
        {
            let Some(resolution) = &dispute.resolution else {
                continue;
            };
            let Some(job) = self.jobs.get(dispute.job_id) else {
                continue;
            };
            let against = match resolution.action {
                ResolutionAction::RefundToClient => self
                    .freelancer_of(&job)
                    .map(|f| (f, ReputationRole::Freelancer)),
                ResolutionAction::ReleaseToFreelancer => Some((job.client, ReputationRole::Client)),
                ResolutionAction::Split { .. } => None,
            };
            if let Some((loser, role)) = against {
                if loser == user {
                    events.push(HistoryEvent::JobFailed {
                        job_id: job.id,
                        role,
                        at: resolution.resolved_at,
                    });
                }
            }
        }

        events.sort_by_key(|e| e.at());
        Ok(events)
    }
}
