//! The error taxonomy the entitlement services surface to callers.

use keygate_storage::StoreError;
use thiserror::Error;

/// Public error type for all entitlement operations.
///
/// The first four variants are deterministic: retrying the same request
/// yields the same outcome, and the message carries enough detail for the
/// caller to correct the request. `External` and `Storage` are
/// infrastructure failures; use [`EntitlementError::is_retryable`] to tell
/// the two classes apart.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external dependency failed: {0}")]
    External(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EntitlementError {
    /// Whether the caller may retry the same request and expect a
    /// different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EntitlementError::External(_) | EntitlementError::Storage(_)
        )
    }
}

/// Default mapping from store errors. Call sites override the generic
/// messages where the operation has a more specific one ("no seats
/// available", "invitation already used or expired").
impl From<StoreError> for EntitlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => EntitlementError::NotFound("entity not found".into()),
            StoreError::AlreadyExists => EntitlementError::Conflict("already exists".into()),
            StoreError::Conflict => EntitlementError::Conflict("conflicting state".into()),
            StoreError::SeatsExhausted => EntitlementError::Conflict("no seats available".into()),
            StoreError::DuplicateLicense => EntitlementError::Conflict(
                "user already holds a license on this subscription".into(),
            ),
            StoreError::Backend(msg) => EntitlementError::Storage(msg),
        }
    }
}
