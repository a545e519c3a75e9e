//! # Marketplace Orchestration
//!
//! The [`Marketplace`] owns every entity store and collaborator and runs
//! each lifecycle operation in three phases:
//!
//! 1. **Decide under the job lock.** Read the current documents, run the
//!    pure transition functions from `gig-state` / `gig-arbitration`, and
//!    stage every resulting write in a [`Staged`] set.
//!
//! 2. **Commit.** Structural invariants are checked on the staged values,
//!    every write is verified against the stored version, and only then
//!    are all writes applied. Settlement plans produced by the transition
//!    are journaled before the lock is released, so a concurrent dispute
//!    always finds a batch to abandon.
//!
//! 3. **Finish outside the lock.** Events are published, documents are
//!    written through to Postgres when configured, settlement plans are
//!    dispatched and their outcomes folded back into the milestone (which
//!    may cascade into invoices and job completion), and affected users'
//!    reputation is resynced.
//!
//! Per-job locks are `parking_lot` mutexes held only inside synchronous
//! closures, so no lock is ever held across an `.await`.

pub mod disputes;
pub mod history;
pub mod jobs;
pub mod milestones;
pub mod reviews;
pub mod settlement;
pub mod sweep;
pub mod workspace;

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use gig_arbitration::Dispute;
use gig_core::{
    publish_all, Actor, BatchId, DomainEvent, EntityKind, EventPublisher, JobId, MilestoneId,
    TracingPublisher, UserId,
};
use gig_escrow::{
    BatchOutcome, EscrowCoordinator, FeeSchedule, RetryPolicy, SettlementGateway, SettlementPlan,
};
use gig_presence::{PresenceConfig, WorkspaceTracker};
use gig_reputation::{MemoryReputationStore, ReputationConfig, ReputationRecord, ReputationService};
use gig_state::{
    check_milestone_totals, transition_job, Bid, DeliveryPackage, Job, JobAction, JobContext,
    JobStatus, Milestone, MilestonePolicy, MilestoneStatus,
};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::error::AppError;
use crate::middleware::metrics::ApiMetrics;
use crate::records::{Invoice, Review};
use crate::state::{AppConfig, Store, Versioned};

pub use history::MarketplaceHistory;
pub use sweep::SweepReport;

// -- Configuration -------------------------------------------------------------

/// Lifecycle tuning applied by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketConfig {
    /// Time a client has to fund after assignment. `None` disables the deadline.
    pub fund_window: Option<Duration>,
    pub policy: MilestonePolicy,
    /// Age after which an open dispute is reported as overdue.
    pub dispute_sla: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            fund_window: Some(Duration::hours(72)),
            policy: MilestonePolicy::default(),
            dispute_sla: Duration::hours(72),
        }
    }
}

impl MarketConfig {
    /// Derive from environment configuration.
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            fund_window: (config.fund_window_hours > 0).then(|| Duration::hours(config.fund_window_hours)),
            policy: MilestonePolicy {
                max_rejections: config.max_rejections,
            },
            dispute_sla: Duration::hours(config.dispute_sla_hours),
        }
    }
}

// -- Documents -----------------------------------------------------------------

/// Any committed document, as handed to the persistence layer.
#[derive(Debug, Clone)]
pub enum Document {
    Job(Job),
    Bid(Bid),
    Milestone(Milestone),
    Delivery(DeliveryPackage),
    Dispute(Dispute),
    Review(Review),
    Invoice(Invoice),
}

impl Document {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Job(_) => Job::KIND,
            Self::Bid(_) => Bid::KIND,
            Self::Milestone(_) => Milestone::KIND,
            Self::Delivery(_) => DeliveryPackage::KIND,
            Self::Dispute(_) => Dispute::KIND,
            Self::Review(_) => Review::KIND,
            Self::Invoice(_) => Invoice::KIND,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Job(v) => v.key(),
            Self::Bid(v) => v.key(),
            Self::Milestone(v) => v.key(),
            Self::Delivery(v) => v.key(),
            Self::Dispute(v) => v.key(),
            Self::Review(v) => v.key(),
            Self::Invoice(v) => v.key(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Job(v) => v.version,
            Self::Bid(v) => v.version,
            Self::Milestone(v) => v.version,
            Self::Delivery(v) => v.version,
            Self::Dispute(v) => v.version,
            Self::Review(v) => v.version,
            Self::Invoice(v) => v.version,
        }
    }

    /// Owning job.
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Job(v) => v.id,
            Self::Bid(v) => v.job_id,
            Self::Milestone(v) => v.job_id,
            Self::Delivery(v) => v.job_id,
            Self::Dispute(v) => v.job_id,
            Self::Review(v) => v.job_id,
            Self::Invoice(v) => v.job_id,
        }
    }

    /// Full document body as JSON.
    pub fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Job(v) => serde_json::to_value(v),
            Self::Bid(v) => serde_json::to_value(v),
            Self::Milestone(v) => serde_json::to_value(v),
            Self::Delivery(v) => serde_json::to_value(v),
            Self::Dispute(v) => serde_json::to_value(v),
            Self::Review(v) => serde_json::to_value(v),
            Self::Invoice(v) => serde_json::to_value(v),
        }
    }
}

// -- Staged writes -------------------------------------------------------------

/// A pending store write.
#[derive(Debug, Clone)]
pub(crate) enum Write<T> {
    Insert(T),
    /// Replace the document currently at the given version.
    Update(u64, T),
}

impl<T: Versioned> Write<T> {
    fn value(&self) -> &T {
        match self {
            Self::Insert(v) | Self::Update(_, v) => v,
        }
    }

    fn check(&self, store: &Store<T>) -> Result<(), AppError> {
        let expected = match self {
            Self::Insert(_) => None,
            Self::Update(v, _) => Some(*v),
        };
        store.check(self.value().key(), expected)?;
        Ok(())
    }

    fn apply(self, store: &Store<T>) -> Result<T, AppError> {
        match self {
            Self::Insert(v) => {
                store.insert_new(v.clone())?;
                Ok(v)
            }
            Self::Update(expected, v) => {
                store.commit(expected, v.clone())?;
                Ok(v)
            }
        }
    }
}

/// Everything one operation wants to change, applied all-or-nothing.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    jobs: Vec<Write<Job>>,
    bids: Vec<Write<Bid>>,
    milestones: Vec<Write<Milestone>>,
    deliveries: Vec<Write<DeliveryPackage>>,
    disputes: Vec<Write<Dispute>>,
    reviews: Vec<Write<Review>>,
    invoices: Vec<Write<Invoice>>,
    events: Vec<DomainEvent>,
    plans: Vec<SettlementPlan>,
    resync: Vec<UserId>,
}

/// Document types a [`Staged`] set can carry.
pub(crate) trait Slot: Versioned + Into<Document> {
    fn writes(staged: &mut Staged) -> &mut Vec<Write<Self>>;
}

macro_rules! slot {
    ($ty:ty, $field:ident, $variant:ident) => {
        impl Slot for $ty {
            fn writes(staged: &mut Staged) -> &mut Vec<Write<Self>> {
                &mut staged.$field
            }
        }

        impl From<$ty> for Document {
            fn from(value: $ty) -> Self {
                Document::$variant(value)
            }
        }
    };
}

slot!(Job, jobs, Job);
slot!(Bid, bids, Bid);
slot!(Milestone, milestones, Milestone);
slot!(DeliveryPackage, deliveries, Delivery);
slot!(Dispute, disputes, Dispute);
slot!(Review, reviews, Review);
slot!(Invoice, invoices, Invoice);

impl Staged {
    pub(crate) fn insert<T: Slot>(&mut self, value: T) {
        T::writes(self).push(Write::Insert(value));
    }

    /// Stage `value` as the successor of the document read at `read_version`.
    pub(crate) fn update<T: Slot>(&mut self, read_version: u64, value: T) {
        T::writes(self).push(Write::Update(read_version, value));
    }

    pub(crate) fn event(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub(crate) fn events(&mut self, events: impl IntoIterator<Item = DomainEvent>) {
        self.events.extend(events);
    }

    pub(crate) fn plan(&mut self, plan: SettlementPlan) {
        self.plans.push(plan);
    }

    pub(crate) fn resync(&mut self, users: impl IntoIterator<Item = UserId>) {
        self.resync.extend(users);
    }

    fn touched_jobs(&self) -> BTreeSet<JobId> {
        let mut ids: BTreeSet<JobId> = self.jobs.iter().map(|w| w.value().id).collect();
        ids.extend(self.bids.iter().map(|w| w.value().job_id));
        ids.extend(self.milestones.iter().map(|w| w.value().job_id));
        ids
    }
}

/// Result of a successful commit, waiting for [`Marketplace::finish`].
#[derive(Debug, Default)]
pub(crate) struct Committed {
    docs: Vec<Document>,
    events: Vec<DomainEvent>,
    plans: Vec<SettlementPlan>,
    resync: Vec<UserId>,
}

impl Committed {
    /// Fold a later commit made under the same lock into this one.
    pub(crate) fn absorb(&mut self, later: Committed) {
        self.docs.extend(later.docs);
        self.events.extend(later.events);
        self.plans.extend(later.plans);
        self.resync.extend(later.resync);
    }
}

fn overlay<T: Versioned>(mut base: Vec<T>, writes: &[Write<T>]) -> Vec<T> {
    for write in writes {
        let value = write.value();
        match base.iter_mut().find(|b| b.key() == value.key()) {
            Some(slot) => *slot = value.clone(),
            None => base.push(value.clone()),
        }
    }
    base
}

/// Version at which `next`'s predecessor was read from `read`.
pub(crate) fn read_version<T: Versioned>(read: &[T], next: &T) -> Result<u64, AppError> {
    read.iter()
        .find(|r| r.key() == next.key())
        .map(Versioned::version)
        .ok_or_else(|| AppError::Internal(format!("{} {} changed without being read", T::KIND, next.key())))
}

fn outcome_label(outcome: &BatchOutcome) -> &'static str {
    match outcome {
        BatchOutcome::Settled => "settled",
        BatchOutcome::Open => "open",
        BatchOutcome::Failed { .. } => "failed",
        BatchOutcome::Stalled { .. } => "stalled",
        BatchOutcome::Voided => "voided",
    }
}

// -- Marketplace ---------------------------------------------------------------

/// Counts of documents loaded from Postgres at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HydrationReport {
    pub documents: usize,
    pub intents: usize,
    pub reputation_records: usize,
}

/// Entity stores plus the collaborators every lifecycle operation needs.
pub struct Marketplace {
    pub(crate) jobs: Store<Job>,
    pub(crate) bids: Store<Bid>,
    pub(crate) milestones: Store<Milestone>,
    pub(crate) deliveries: Store<DeliveryPackage>,
    pub(crate) disputes: Store<Dispute>,
    pub(crate) reviews: Store<Review>,
    pub(crate) invoices: Store<Invoice>,
    pub(crate) escrow: EscrowCoordinator,
    pub(crate) workspaces: Arc<WorkspaceTracker>,
    pub(crate) reputation: ReputationService,
    pub(crate) reputation_store: Arc<MemoryReputationStore>,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) config: MarketConfig,
    pub(crate) metrics: ApiMetrics,
    pub(crate) db: Option<PgPool>,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Marketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marketplace")
            .field("jobs", &self.jobs.len())
            .field("milestones", &self.milestones.len())
            .field("disputes", &self.disputes.len())
            .field("escrow", &self.escrow)
            .field("config", &self.config)
            .field("persistent", &self.db.is_some())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Marketplace`]. Everything but the gateway has a default.
pub struct MarketplaceBuilder {
    gateway: Arc<dyn SettlementGateway>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
    fees: FeeSchedule,
    presence: PresenceConfig,
    reputation: ReputationConfig,
    config: MarketConfig,
    metrics: Option<ApiMetrics>,
    db: Option<PgPool>,
}

impl MarketplaceBuilder {
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fees(mut self, fees: FeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    pub fn presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    pub fn reputation(mut self, reputation: ReputationConfig) -> Self {
        self.reputation = reputation;
        self
    }

    pub fn config(mut self, config: MarketConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry, e.g. the one served on `/metrics`.
    pub fn metrics(mut self, metrics: ApiMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Write committed documents through to Postgres.
    pub fn database(mut self, pool: PgPool) -> Self {
        self.db = Some(pool);
        self
    }

    pub fn build(self) -> Result<Marketplace, prometheus::Error> {
        let metrics = match self.metrics {
            Some(m) => m,
            None => ApiMetrics::new()?,
        };
        let jobs = Store::new();
        let bids = Store::new();
        let disputes = Store::new();
        let reviews = Store::new();
        let history = Arc::new(MarketplaceHistory::new(
            jobs.clone(),
            bids.clone(),
            disputes.clone(),
            reviews.clone(),
        ));
        let reputation_store = Arc::new(MemoryReputationStore::new());
        let reputation = ReputationService::new(
            history,
            reputation_store.clone(),
            self.publisher.clone(),
            self.reputation,
        );
        let escrow = EscrowCoordinator::new(
            self.gateway,
            Arc::new(gig_escrow::IntentJournal::new()),
            self.retry,
            self.fees,
        );
        Ok(Marketplace {
            jobs,
            bids,
            milestones: Store::new(),
            deliveries: Store::new(),
            disputes,
            reviews,
            invoices: Store::new(),
            escrow,
            workspaces: Arc::new(WorkspaceTracker::new(self.presence)),
            reputation,
            reputation_store,
            publisher: self.publisher,
            config: self.config,
            metrics,
            db: self.db,
            locks: DashMap::new(),
        })
    }
}

impl Marketplace {
    /// Start building a marketplace around a settlement gateway.
    pub fn builder(gateway: Arc<dyn SettlementGateway>) -> MarketplaceBuilder {
        MarketplaceBuilder {
            gateway,
            publisher: Arc::new(TracingPublisher),
            retry: RetryPolicy::default(),
            fees: FeeSchedule::default(),
            presence: PresenceConfig::default(),
            reputation: ReputationConfig::default(),
            config: MarketConfig::default(),
            metrics: None,
            db: None,
        }
    }

    pub fn jobs(&self) -> &Store<Job> {
        &self.jobs
    }

    pub fn bids(&self) -> &Store<Bid> {
        &self.bids
    }

    pub fn milestones(&self) -> &Store<Milestone> {
        &self.milestones
    }

    pub fn deliveries(&self) -> &Store<DeliveryPackage> {
        &self.deliveries
    }

    pub fn disputes(&self) -> &Store<Dispute> {
        &self.disputes
    }

    pub fn reviews(&self) -> &Store<Review> {
        &self.reviews
    }

    pub fn invoices(&self) -> &Store<Invoice> {
        &self.invoices
    }

    pub fn escrow(&self) -> &EscrowCoordinator {
        &self.escrow
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceTracker> {
        &self.workspaces
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ApiMetrics {
        &self.metrics
    }

    // -- Locking and commit ----------------------------------------------------

    fn lock_for(&self, job_id: JobId) -> Arc<Mutex<()>> {
        self.locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the job's lock.
    pub(crate) fn locked<R>(
        &self,
        job_id: JobId,
        f: impl FnOnce() -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock();
        f()
    }

    /// Validate and apply every staged write. Caller holds the job lock.
    pub(crate) fn commit(&self, staged: Staged) -> Result<Committed, AppError> {
        self.verify_invariants(&staged)?;

        for w in &staged.jobs {
            w.check(&self.jobs)?;
        }
        for w in &staged.bids {
            w.check(&self.bids)?;
        }
        for w in &staged.milestones {
            w.check(&self.milestones)?;
        }
        for w in &staged.deliveries {
            w.check(&self.deliveries)?;
        }
        for w in &staged.disputes {
            w.check(&self.disputes)?;
        }
        for w in &staged.reviews {
            w.check(&self.reviews)?;
        }
        for w in &staged.invoices {
            w.check(&self.invoices)?;
        }

        let mut docs = Vec::new();
        for w in staged.jobs {
            docs.push(w.apply(&self.jobs)?.into());
        }
        for w in staged.bids {
            docs.push(w.apply(&self.bids)?.into());
        }
        for w in staged.milestones {
            docs.push(w.apply(&self.milestones)?.into());
        }
        for w in staged.deliveries {
            docs.push(w.apply(&self.deliveries)?.into());
        }
        for w in staged.disputes {
            docs.push(w.apply(&self.disputes)?.into());
        }
        for w in staged.reviews {
            docs.push(w.apply(&self.reviews)?.into());
        }
        for w in staged.invoices {
            docs.push(w.apply(&self.invoices)?.into());
        }

        for plan in &staged.plans {
            self.escrow.register(plan);
        }

        Ok(Committed {
            docs,
            events: staged.events,
            plans: staged.plans,
            resync: staged.resync,
        })
    }

    fn verify_invariants(&self, staged: &Staged) -> Result<(), AppError> {
        for job_id in staged.touched_jobs() {
            let job = match staged.jobs.iter().rev().find(|w| w.value().id == job_id) {
                Some(w) => w.value().clone(),
                None => self.jobs.require(job_id)?,
            };
            let bids = overlay(self.bids.filter(|b| b.job_id == job_id), &staged.bids);
            let milestones = overlay(
                self.milestones.filter(|m| m.job_id == job_id),
                &staged.milestones,
            );
            job.check_invariants()
                .and_then(|_| check_milestone_totals(&job, &bids, &milestones))
                .map_err(|violation| {
                    tracing::error!(job_id = %job_id, %violation, "refusing to commit invariant violation");
                    AppError::Internal(format!("invariant violation: {violation}"))
                })?;
        }
        Ok(())
    }

    /// Count a transition attempt and pass the result through.
    pub(crate) fn observe<T>(
        &self,
        entity: &str,
        action: &str,
        result: Result<T, AppError>,
    ) -> Result<T, AppError> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        self.metrics.record_transition(entity, action, outcome);
        result
    }

    // -- After commit ----------------------------------------------------------

    /// Publish, persist, settle and resync. Never fails: the state change is
    /// already committed, so every failure here is logged.
    pub(crate) async fn finish(&self, committed: Committed) {
        let mut queue = VecDeque::from([committed]);
        let mut resync: BTreeSet<UserId> = BTreeSet::new();

        while let Some(c) = queue.pop_front() {
            publish_all(self.publisher.as_ref(), &c.events);
            self.persist(&c.docs).await;
            resync.extend(c.resync);

            for plan in c.plans {
                let outcome = match self.escrow.submit_plan(&plan).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(batch_id = %plan.batch_id, error = %e, "settlement dispatch failed");
                        BatchOutcome::Stalled {
                            reason: e.to_string(),
                        }
                    }
                };
                self.metrics.record_settlement(outcome_label(&outcome));
                self.persist_batch(&plan.batch_id).await;
                match self.apply_batch_outcome(plan.job_id, plan.milestone_id, plan.batch_id, &outcome) {
                    Ok(Some(next)) => queue.push_back(next),
                    Ok(None) => {}
                    Err(e) => tracing::error!(
                        batch_id = %plan.batch_id,
                        milestone_id = %plan.milestone_id,
                        error = %e,
                        "could not apply settlement outcome"
                    ),
                }
            }
        }

        for user in resync {
            self.resync_user(user).await;
        }
    }

    /// Fold a batch outcome into its milestone, cascading into the invoice
    /// and job completion when the milestone completes.
    pub(crate) fn apply_batch_outcome(
        &self,
        job_id: JobId,
        milestone_id: MilestoneId,
        batch: BatchId,
        outcome: &BatchOutcome,
    ) -> Result<Option<Committed>, AppError> {
        self.locked(job_id, || {
            let job = self.jobs.require(job_id)?;
            let milestone = self.milestones.require(milestone_id)?;
            let now = Utc::now();
            let mut staged = Staged::default();
            if milestone.pending_batch != Some(batch) {
                if milestone.settlement_stalled || !self.escrow.has_orphaned_legs(&batch) {
                    tracing::debug!(batch_id = %batch, milestone_id = %milestone_id, "settlement outcome for a superseded batch");
                    return Ok(None);
                }
                let (next, event) = milestone.flag_batch_stalled(
                    &job,
                    Some(batch),
                    "funds moved on an abandoned settlement batch",
                    now,
                );
                tracing::error!(milestone_id = %milestone_id, batch_id = %batch, "funds moved on an abandoned settlement batch; operator action required");
                staged.event(event);
                staged.update(milestone.version, next);
                return self.commit(staged).map(Some);
            }

            match outcome {
                BatchOutcome::Settled => {
                    let (next, events) = milestone.apply_settlement(&job, now)?;
                    staged.events(events);
                    if next.status == MilestoneStatus::Completed {
                        let freelancer = self.freelancer_of(&job).ok_or_else(|| {
                            AppError::Internal(format!("job {job_id} settled without a freelancer"))
                        })?;
                        let legs = self.escrow.receipts(&batch);
                        staged.insert(Invoice::issue(&job, &next, freelancer, &legs, now)?);
                        self.complete_if_settled(&job, &next, &mut staged)?;
                    }
                    staged.update(milestone.version, next);
                }
                BatchOutcome::Failed { reason } if milestone.settlement_revert_to.is_some() => {
                    let (next, event) = milestone.revert_settlement(&job, reason, now)?;
                    tracing::warn!(milestone_id = %milestone_id, reverted_to = %next.status, %reason, "settlement failed; transition rolled back");
                    staged.event(event);
                    staged.update(milestone.version, next);
                }
                BatchOutcome::Failed { reason } | BatchOutcome::Stalled { reason } => {
                    if milestone.settlement_stalled {
                        return Ok(None);
                    }
                    let (next, event) = milestone.flag_stalled(&job, reason, now);
                    tracing::error!(milestone_id = %milestone_id, batch_id = %batch, %reason, "settlement stalled; operator action required");
                    staged.event(event);
                    staged.update(milestone.version, next);
                }
                BatchOutcome::Open | BatchOutcome::Voided => return Ok(None),
            }
            self.commit(staged).map(Some)
        })
    }

    /// Auto-complete an in-progress job once its last live milestone completes.
    fn complete_if_settled(
        &self,
        job: &Job,
        completed: &Milestone,
        staged: &mut Staged,
    ) -> Result<(), AppError> {
        if job.status != JobStatus::InProgress {
            return Ok(());
        }
        let milestones: Vec<Milestone> = self
            .milestones
            .filter(|m| m.job_id == job.id)
            .into_iter()
            .map(|m| if m.id == completed.id { completed.clone() } else { m })
            .collect();
        let done = milestones
            .iter()
            .filter(|m| m.status != MilestoneStatus::Cancelled)
            .all(|m| m.status == MilestoneStatus::Completed);
        if !done {
            return Ok(());
        }
        let bids = self.bids.filter(|b| b.job_id == job.id);
        let t = transition_job(
            job,
            JobAction::Complete,
            &Actor::system(),
            &JobContext {
                bids: &bids,
                milestones: &milestones,
                fund_window: None,
                now: Utc::now(),
            },
        )?;
        tracing::info!(job_id = %job.id, "all milestones settled; job completed");
        staged.resync(job.parties());
        staged.events(t.events);
        staged.update(job.version, t.job);
        Ok(())
    }

    /// Freelancer who holds or held the job.
    pub(crate) fn freelancer_of(&self, job: &Job) -> Option<UserId> {
        job.freelancer.or_else(|| {
            job.accepted_bid
                .and_then(|bid| self.bids.get(bid))
                .map(|bid| bid.freelancer)
        })
    }

    pub(crate) async fn resync_user(&self, user: UserId) {
        match self.reputation.sync_user_reputation(user) {
            Ok(report) => {
                let records: Vec<ReputationRecord> = report
                    .freelancer_reputation
                    .into_iter()
                    .chain(report.client_reputation)
                    .collect();
                self.persist_reputation(&records).await;
            }
            Err(e) => tracing::warn!(user_id = %user, error = %e, "reputation resync failed"),
        }
    }

    // -- Persistence -----------------------------------------------------------

    async fn persist(&self, docs: &[Document]) {
        let Some(pool) = &self.db else { return };
        if docs.is_empty() {
            return;
        }
        if let Err(e) = db::documents::save_all(pool, docs).await {
            tracing::error!(error = %e, count = docs.len(), "failed to persist committed documents");
        }
    }

    async fn persist_batch(&self, batch: &BatchId) {
        let Some(pool) = &self.db else { return };
        let entries = self.escrow.journal().batch(batch);
        if let Err(e) = db::intents::save_all(pool, &entries).await {
            tracing::error!(batch_id = %batch, error = %e, "failed to persist settlement journal");
        }
    }

    pub(crate) async fn persist_reputation(&self, records: &[ReputationRecord]) {
        let Some(pool) = &self.db else { return };
        if let Err(e) = db::reputation::save_all(pool, records).await {
            tracing::error!(error = %e, "failed to persist reputation records");
        }
    }

    /// Load every persisted document, journal entry and reputation record.
    pub async fn hydrate(&self) -> Result<HydrationReport, AppError> {
        let Some(pool) = &self.db else {
            return Ok(HydrationReport::default());
        };
        let docs = db::documents::load_all(pool).await?;
        let mut report = HydrationReport {
            documents: docs.len(),
            ..HydrationReport::default()
        };
        for doc in docs {
            match doc {
                Document::Job(v) => self.jobs.restore(v),
                Document::Bid(v) => self.bids.restore(v),
                Document::Milestone(v) => self.milestones.restore(v),
                Document::Delivery(v) => self.deliveries.restore(v),
                Document::Dispute(v) => self.disputes.restore(v),
                Document::Review(v) => self.reviews.restore(v),
                Document::Invoice(v) => self.invoices.restore(v),
            }
        }

        let entries = db::intents::load_all(pool).await?;
        report.intents = entries.len();
        self.escrow.journal().restore(entries);

        let records = db::reputation::load_all(pool).await?;
        report.reputation_records = records.len();
        for record in records {
            gig_reputation::ReputationStore::upsert(self.reputation_store.as_ref(), record)?;
        }

        tracing::info!(
            documents = report.documents,
            intents = report.intents,
            reputation_records = report.reputation_records,
            "state hydrated from database"
        );
        Ok(report)
    }

    // -- Metrics ---------------------------------------------------------------

    /// Recompute the entity gauges served on `/metrics`.
    pub fn refresh_gauges(&self) {
        let jobs = self.metrics.jobs_total();
        jobs.reset();
        for job in self.jobs.list() {
            jobs.with_label_values(&[job.status.as_str()]).inc();
        }
        let milestones = self.metrics.milestones_total();
        milestones.reset();
        let mut stalled = 0usize;
        for m in self.milestones.list() {
            milestones.with_label_values(&[m.status.as_str()]).inc();
            if m.settlement_stalled {
                stalled += 1;
            }
        }
        self.metrics.stalled_settlements().set(stalled as f64);
        let open = self.disputes.filter(|d| d.status.is_open()).len();
        self.metrics.open_disputes().set(open as f64);
        self.metrics.workspace_sessions().set(self.workspaces.len() as f64);
    }
}
