//! # API Route Modules
//!
//! - `jobs`: posting, listing, assignment and job-level transitions, plus
//!   the milestones, bids, invoices and reviews nested under a job.
//! - `bids`: shortlist, decline and withdraw.
//! - `milestones`: fund, start, submit, approve, reject, deliveries and
//!   raising disputes.
//! - `disputes`: arbiter queue, claim, resolve and dismiss.
//! - `settlement`: acknowledgments from the rail, operator retries and
//!   journal inspection.
//! - `workspace`: presence sessions.
//! - `reputation`: profiles, reviews received, resync, integrity and decay.
//! - `admin`: the deadline sweep.
//!
//! Every handler resolves the caller with the [`CallerIdentity`] extractor
//! and delegates to [`crate::orchestration::Marketplace`]; none of them
//! touch a store directly.
//!
//! [`CallerIdentity`]: crate::auth::CallerIdentity

pub mod admin;
pub mod bids;
pub mod disputes;
pub mod jobs;
pub mod milestones;
pub mod reputation;
pub mod settlement;
pub mod workspace;

use gig_core::Amount;

/// Parse a decimal amount field such as `"1000"` or `"12.50"`.
pub(crate) fn parse_amount(field: &str, raw: &str) -> Result<Amount, String> {
    raw.trim()
        .parse::<Amount>()
        .map_err(|e| format!("{field}: {e}"))
}

/// Optimistic-concurrency guard accepted by every transition endpoint.
#[derive(Debug, Default, serde::Deserialize, utoipa::ToSchema)]
#[serde(deny_unknown_fields)]
pub struct VersionGuard {
    /// When set, the request fails with `CONFLICT` unless the entity is
    /// still at this version.
    pub expected_version: Option<u64>,
}

/// Version from an optional [`VersionGuard`] body. A missing or empty body
/// means the caller does not guard the write.
pub(crate) fn expected(guard: Option<axum::Json<VersionGuard>>) -> Option<u64> {
    guard.and_then(|axum::Json(g)| g.expected_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_parse_with_field_context() {
        assert_eq!(parse_amount("amount", " 12.5 ").unwrap().minor(), 1250);
        let err = parse_amount("budget_min", "-3").unwrap_err();
        assert!(err.starts_with("budget_min:"));
    }
}
