//! # Tally Notary
//!
//! The uniqueness provider: the consensus-critical component that binds each
//! consumed state to exactly one transaction.
//!
//! Business rejections ([`CommitOutcome::Conflict`],
//! [`CommitOutcome::TimeWindowInvalid`]) are ordinary return values.
//! [`UniquenessError`] is reserved for infrastructure faults such as an
//! unavailable store, which are never retried inside the provider.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod provider;
mod time_window;

pub use error::{Result, UniquenessError};
pub use provider::{
    CommitOutcome, CommitRequest, Conflict, ConflictingState, PersistentUniquenessProvider,
    UniquenessProvider, UniquenessStats,
};
pub use time_window::TimeWindowChecker;
