//! # Delivery Packages
//!
//! What a freelancer hands in for a milestone: a file manifest plus a note.
//! The manifest is content-addressed: entries are sorted by name, encoded
//! as JSON, and hashed with SHA-256 so a later reader can tell whether the
//! stored manifest still matches what the client accepted.
//!
//! A package is immutable once accepted.

use chrono::{DateTime, Utc};
use gig_core::{Actor, DeliveryId, EntityKind, JobId, MilestoneId, Rejection, Role, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::Job;
use crate::milestone::{Milestone, MilestoneStatus};

/// Review outcome of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Accepted,
    Rejected,
}

impl DeliveryStatus {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivered file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File name, unique within the package.
    pub name: String,
    /// Where the content lives (object key, URL).
    pub content_ref: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the content, when the uploader supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A freelancer's hand-in for one milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPackage {
    pub id: DeliveryId,
    pub job_id: JobId,
    pub milestone_id: MilestoneId,
    pub deliverer: UserId,
    pub files: Vec<FileEntry>,
    pub note: String,
    /// Hex SHA-256 over the canonical manifest.
    pub manifest_digest: String,
    pub status: DeliveryStatus,
    pub version: u64,
    pub delivered_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Hex SHA-256 of the canonical encoding of `files`.
pub fn manifest_digest(files: &[FileEntry]) -> String {
    let mut sorted: Vec<&FileEntry> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut hasher = Sha256::new();
    for entry in sorted {
        // Struct field order is fixed, so the encoding is deterministic.
        if let Ok(bytes) = serde_json::to_vec(entry) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn is_hex_sha256(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl DeliveryPackage {
    /// Hand in work for `milestone`. Only the job's freelancer may deliver,
    /// and only while the milestone is being worked on or was sent back.
    pub fn deliver(
        job: &Job,
        milestone: &Milestone,
        actor: &Actor,
        files: Vec<FileEntry>,
        note: String,
        now: DateTime<Utc>,
    ) -> Result<DeliveryPackage, Rejection> {
        let freelancer = match (actor.role, actor.user_id) {
            (Role::Freelancer, Some(user)) if job.freelancer == Some(user) => user,
            _ => return Err(Rejection::forbidden("deliver work", actor.role)),
        };
        if milestone.job_id != job.id {
            return Err(Rejection::validation("milestone belongs to another job"));
        }
        if !matches!(
            milestone.status,
            MilestoneStatus::InProgress | MilestoneStatus::Rejected
        ) {
            return Err(Rejection::invalid(
                EntityKind::Delivery,
                milestone.status,
                "deliver",
                "milestone is not awaiting work",
            ));
        }
        if files.is_empty() {
            return Err(Rejection::validation("delivery manifest must list at least one file"));
        }
        let mut names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Rejection::validation("file names must be unique within a delivery"));
        }
        for file in &files {
            if file.name.trim().is_empty() || file.content_ref.trim().is_empty() {
                return Err(Rejection::validation("file name and content reference are required"));
            }
            if let Some(digest) = &file.sha256 {
                if !is_hex_sha256(digest) {
                    return Err(Rejection::validation(format!(
                        "file {:?} carries a malformed sha256",
                        file.name
                    )));
                }
            }
        }

        let manifest_digest = manifest_digest(&files);
        Ok(DeliveryPackage {
            id: DeliveryId::new(),
            job_id: job.id,
            milestone_id: milestone.id,
            deliverer: freelancer,
            files,
            note,
            manifest_digest,
            status: DeliveryStatus::Delivered,
            version: 1,
            delivered_at: now,
            decided_at: None,
        })
    }

    /// Client accepts the package alongside milestone approval.
    pub fn accept(&self, job: &Job, actor: &Actor, now: DateTime<Utc>) -> Result<DeliveryPackage, Rejection> {
        self.decide(job, actor, DeliveryStatus::Accepted, now)
    }

    /// Client rejects the package alongside milestone rejection.
    pub fn reject(&self, job: &Job, actor: &Actor, now: DateTime<Utc>) -> Result<DeliveryPackage, Rejection> {
        self.decide(job, actor, DeliveryStatus::Rejected, now)
    }

    /// Whether the stored digest still matches the stored manifest.
    pub fn verify_manifest(&self) -> bool {
        manifest_digest(&self.files) == self.manifest_digest
    }

    fn decide(
        &self,
        job: &Job,
        actor: &Actor,
        to: DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<DeliveryPackage, Rejection> {
        if actor.role != Role::Client || actor.user_id != Some(job.client) {
            return Err(Rejection::forbidden(format!("mark delivery {to}"), actor.role));
        }
        if self.status != DeliveryStatus::Delivered {
            return Err(Rejection::invalid(
                EntityKind::Delivery,
                self.status,
                to.as_str(),
                "delivery was already decided",
            ));
        }
        let mut next = self.clone();
        next.status = to;
        next.decided_at = Some(now);
        next.version += 1;
        Ok(next)
    }
}
