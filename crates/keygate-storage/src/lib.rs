//! Storage abstraction for keygate.
//!
//! Backend crates (e.g., keygate-store-memory, a future SQL backend) implement
//! the [`Store`] trait so the entitlement services don't depend on any specific
//! database engine or schema details.
//!
//! Invariant-bearing mutations (seat reservation, checked license creation,
//! invitation consumption, processed-event claims) are single trait methods:
//! a backend must execute each one as one transaction, never as separate
//! read/check/write calls.

use thiserror::Error;

mod store;
pub mod types;

pub use store::Store;
pub use types::*;

/// Uniform error type for all storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict")]
    Conflict,
    #[error("no seats available")]
    SeatsExhausted,
    #[error("duplicate active license for user and subscription")]
    DuplicateLicense,
    #[error("backend error: {0}")]
    Backend(String),
}
