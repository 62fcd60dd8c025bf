use tracing::warn;

use crate::record::RecordId;

/// Result alias used by the record, lock and service layers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy for record access and accrual.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The record does not exist (or vanished while waiting for its lock).
    #[error("record {0} not found")]
    NotFound(RecordId),

    /// The record's lock could not be obtained within the caller's timeout.
    #[error("record {0} is busy, retry later")]
    Busy(RecordId),

    /// The underlying store failed to read or write.
    #[error("persistence failure: {0:#}")]
    PersistenceFailure(anyhow::Error),

    /// A caller broke the locking contract.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}

/// Report a broken contract: panics in debug builds, logs and returns an
/// [`Error::InvariantViolation`] otherwise.
pub(crate) fn invariant_violation(detail: impl Into<String>) -> Error {
    let detail = detail.into();
    if cfg!(debug_assertions) {
        panic!("invariant violation: {detail}");
    }
    warn!("invariant violation: {detail}");
    Error::InvariantViolation(detail)
}
