//! Reviews, invoices and reputation maintenance.

use chrono::{DateTime, Utc};
use gig_core::{EntityKind, JobId, Rejection, UserId};
use gig_reputation::{DecayReport, IntegrityReport, ReputationRecord, ReputationRole, ReputationStore, SyncReport};
use serde::Serialize;

use super::{Marketplace, Staged};
use crate::auth::{CallerIdentity, CallerKind};
use crate::error::AppError;
use crate::records::{Invoice, Review};

/// Both role records of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReputationProfile {
    pub user_id: UserId,
    pub freelancer: Option<ReputationRecord>,
    pub client: Option<ReputationRecord>,
}

impl Marketplace {
    /// Rate the counterparty of a completed job.
    pub async fn submit_review(
        &self,
        caller: &CallerIdentity,
        job_id: JobId,
        rating: u8,
        comment: String,
    ) -> Result<Review, AppError> {
        let reviewer = caller.require_member("review job")?;
        let result = self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let freelancer = self.freelancer_of(&job).ok_or_else(|| {
                Rejection::invalid(EntityKind::Review, job.status, "review", "job never had a freelancer")
            })?;
            let existing = self.reviews.filter(|r| r.job_id == job_id);
            let review = Review::submit(&job, &existing, reviewer, freelancer, rating, comment, Utc::now())?;
            let mut staged = Staged::default();
            staged.resync([review.reviewee]);
            staged.insert(review.clone());
            Ok((review, self.commit(staged)?))
        });
        let (review, committed) = self.observe("review", "submit", result)?;
        self.finish(committed).await;
        Ok(review)
    }

    /// Reviews received by `user`, newest first.
    pub fn reviews_for(&self, user: UserId) -> Vec<Review> {
        let mut reviews = self.reviews.filter(|r| r.reviewee == user);
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reviews
    }

    /// Invoices issued for a job's completed milestones, oldest first.
    pub fn invoices_for(&self, job_id: JobId) -> Result<Vec<Invoice>, AppError> {
        self.jobs.require(job_id)?;
        let mut invoices = self.invoices.filter(|i| i.job_id == job_id);
        invoices.sort_by_key(|i| i.issued_at);
        Ok(invoices)
    }

    pub fn reputation_of(&self, user: UserId) -> Result<ReputationProfile, AppError> {
        Ok(ReputationProfile {
            user_id: user,
            freelancer: self.reputation.record(user, ReputationRole::Freelancer)?,
            client: self.reputation.record(user, ReputationRole::Client)?,
        })
    }

    /// Recompute a user's records from scratch. Users may resync
    /// themselves; the system may resync anyone.
    pub async fn sync_reputation(&self, caller: &CallerIdentity, user: UserId) -> Result<SyncReport, AppError> {
        if caller.kind != CallerKind::System && caller.user_id != Some(user) {
            return Err(AppError::Forbidden("reputation can only be resynced by its owner".into()));
        }
        let report = self.reputation.sync_user_reputation(user)?;
        let records: Vec<ReputationRecord> = report
            .freelancer_reputation
            .iter()
            .chain(report.client_reputation.iter())
            .cloned()
            .collect();
        self.persist_reputation(&records).await;
        Ok(report)
    }

    /// Decay inactive records as of `as_of`. Repeating within one UTC day
    /// changes nothing.
    pub async fn apply_decay(&self, caller: &CallerIdentity, as_of: DateTime<Utc>) -> Result<DecayReport, AppError> {
        caller.require_system()?;
        let report = self.reputation.apply_reputation_decay(as_of)?;
        if report.decayed > 0 {
            let records = self.reputation_store.all()?;
            self.persist_reputation(&records).await;
        }
        Ok(report)
    }

    /// Compare stored records against a fresh computation.
    pub fn verify_reputation(&self, user: UserId) -> Result<IntegrityReport, AppError> {
        Ok(self.reputation.verify_reputation_integrity(user)?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use super::*;
    use chrono::Duration;
    use gig_core::RejectionCode;

    async fn completed(h: &Harness) -> JobId {
        let (job, ms) = h.assigned_job(&[800]).await;
        h.submitted(ms[0].id).await;
        h.market
            .approve_milestone(&h.client(), ms[0].id, None, None)
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn completion_and_review_feed_reputation() {
        let h = Harness::new();
        let job_id = completed(&h).await;

        let before = h.market.reputation_of(h.freelancer).unwrap();
        let record = before.freelancer.unwrap();
        assert_eq!(record.completed_jobs, 1);
        assert_eq!(record.review_count, 0);

        let review = h
            .market
            .submit_review(&h.client(), job_id, 5, "excellent".into())
            .await
            .unwrap();
        assert_eq!(review.reviewee, h.freelancer);
        let after = h.market.reputation_of(h.freelancer).unwrap().freelancer.unwrap();
        assert_eq!(after.review_count, 1);
        assert!(h.market.verify_reputation(h.freelancer).unwrap().is_valid);
        assert_eq!(h.market.reviews_for(h.freelancer).len(), 1);
    }

    #[tokio::test]
    async fn resync_is_idempotent() {
        let h = Harness::new();
        let job_id = completed(&h).await;
        h.market
            .submit_review(&h.freelancer(), job_id, 4, "clear brief".into())
            .await
            .unwrap();

        let caller = CallerIdentity::system();
        let first = h.market.sync_reputation(&caller, h.client).await.unwrap();
        let second = h.market.sync_reputation(&caller, h.client).await.unwrap();
        assert_eq!(first.client_reputation, second.client_reputation);
        assert_eq!(second.nfts_minted, 0);
        assert_eq!(second.achievements_awarded, 0);
    }

    #[tokio::test]
    async fn reviews_need_a_completed_job_and_one_per_party() {
        let h = Harness::new();
        let (job, _) = h.assigned_job(&[100]).await;
        let err = h
            .market
            .submit_review(&h.client(), job.id, 5, String::new())
            .await
            .unwrap_err();
        match err {
            AppError::Rejected(r) => assert_eq!(r.code(), RejectionCode::InvalidTransition),
            other => panic!("unexpected {other:?}"),
        }

        let job_id = completed(&h).await;
        h.market.submit_review(&h.client(), job_id, 3, "ok".into()).await.unwrap();
        assert!(h
            .market
            .submit_review(&h.client(), job_id, 4, "changed my mind".into())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn decay_is_system_only_and_daily() {
        let h = Harness::new();
        completed(&h).await;
        let far = Utc::now() + Duration::days(400);

        assert!(matches!(
            h.market.apply_decay(&h.client(), far).await.unwrap_err(),
            AppError::Forbidden(_)
        ));
        let first = h.market.apply_decay(&CallerIdentity::system(), far).await.unwrap();
        assert!(first.decayed > 0);
        let again = h.market.apply_decay(&CallerIdentity::system(), far).await.unwrap();
        assert_eq!(again.decayed, 0);

        let record = h.market.reputation_of(h.freelancer).unwrap().freelancer.unwrap();
        assert!(record.decay_adjusted_score < record.score);
    }
}
