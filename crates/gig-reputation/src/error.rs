//! Reputation service errors.

use thiserror::Error;

/// Failures reading history or writing records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReputationError {
    /// History could not be read.
    #[error("reputation history unavailable: {0}")]
    History(String),
    /// The record store refused a read or write.
    #[error("reputation store error: {0}")]
    Store(String),
}
