//! # Identity Newtypes
//!
//! One UUID-backed identifier per entity kind. All of them are valid by
//! construction and serialize transparently as the bare UUID string, so the
//! wire format stays `"550e8400-..."` while the type system keeps a
//! [`BidId`] from being handed to something expecting a [`MilestoneId`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Prefixed form used in log lines and audit trails, e.g. `job:<uuid>`.
            pub fn tagged(&self) -> String {
                format!("{}:{}", $prefix, self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// A marketplace participant. Roles are never stored on the user; they
    /// are resolved per job (client, freelancer) or granted by credentials
    /// (arbiter).
    UserId,
    "user"
);
uuid_id!(
    /// A job posted by a client.
    JobId,
    "job"
);
uuid_id!(
    /// A freelancer's bid on a job.
    BidId,
    "bid"
);
uuid_id!(
    /// A funded sub-deliverable of a job.
    MilestoneId,
    "milestone"
);
uuid_id!(
    /// A delivery package submitted against a milestone.
    DeliveryId,
    "delivery"
);
uuid_id!(
    /// A dispute over a milestone.
    DisputeId,
    "dispute"
);
uuid_id!(
    /// A single settlement intent (one leg of a payout). This is the
    /// idempotency key handed to the settlement collaborator.
    IntentId,
    "intent"
);
uuid_id!(
    /// The set of settlement legs planned for one milestone payout.
    BatchId,
    "batch"
);
uuid_id!(
    /// An issued invoice.
    InvoiceId,
    "invoice"
);
uuid_id!(
    /// A review left by one party of a completed job about the other.
    ReviewId,
    "review"
);
uuid_id!(
    /// An ephemeral workspace presence session.
    SessionId,
    "session"
);
