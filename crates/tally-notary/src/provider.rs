//! The uniqueness provider.

use crate::{Result, TimeWindowChecker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_storage::{CommitResult, CommitmentStore, ConsumingTx};
use tally_types::{PartyName, StateRef, TimeWindow, Timestamp, TransactionId};

/// A request to bind a transaction's inputs to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// The consuming transaction.
    pub tx_id: TransactionId,
    /// The states it consumes, in transaction order.
    pub inputs: Vec<StateRef>,
    /// The transaction's validity window.
    pub time_window: Option<TimeWindow>,
    /// The party asking for notarisation.
    pub caller: PartyName,
}

/// A state that is already bound to some transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingState {
    /// The contested state.
    pub state_ref: StateRef,
    /// Its existing binding.
    pub consumed_by: ConsumingTx,
}

/// A rejected commitment and the bindings that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// The transaction that was rejected.
    pub tx_id: TransactionId,
    /// Every requested state that was already bound.
    pub states: Vec<ConflictingState>,
}

impl Conflict {
    /// Transactions the contested states are bound to, deduplicated.
    pub fn winning_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.states.iter().map(|s| s.consumed_by.id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Business-level outcome of a commitment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// The inputs are bound to the transaction (now, or by an earlier identical request).
    Committed,
    /// Some inputs are bound elsewhere; nothing was written.
    Conflict(Conflict),
    /// The notary clock is outside the window; nothing was attempted.
    TimeWindowInvalid {
        /// Notary clock reading.
        current: Timestamp,
        /// The window supplied.
        window: TimeWindow,
    },
}

/// Decides whether a transaction may consume its inputs.
pub trait UniquenessProvider: Send + Sync {
    /// Processes a commitment request.
    fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome>;
}

/// Counters describing provider activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniquenessStats {
    /// Requests that bound new states.
    pub committed: u64,
    /// Requests answered as idempotent retries.
    pub duplicates: u64,
    /// Requests rejected as conflicts.
    pub conflicts: u64,
    /// Requests rejected for their time window.
    pub time_window_rejections: u64,
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    duplicates: AtomicU64,
    conflicts: AtomicU64,
    time_window_rejections: AtomicU64,
}

/// Uniqueness provider backed by a durable [`CommitmentStore`].
pub struct PersistentUniquenessProvider {
    store: Arc<dyn CommitmentStore>,
    time_window: TimeWindowChecker,
    counters: Counters,
}

impl PersistentUniquenessProvider {
    /// Creates a provider over `store`, validating windows with `time_window`.
    pub fn new(store: Arc<dyn CommitmentStore>, time_window: TimeWindowChecker) -> Self {
        Self {
            store,
            time_window,
            counters: Counters::default(),
        }
    }

    /// Reads the binding of a state.
    pub fn consumer_of(&self, state: &StateRef) -> Result<Option<ConsumingTx>> {
        Ok(self.store.get(state)?)
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> UniquenessStats {
        UniquenessStats {
            committed: self.counters.committed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            time_window_rejections: self.counters.time_window_rejections.load(Ordering::Relaxed),
        }
    }
}

impl UniquenessProvider for PersistentUniquenessProvider {
    fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome> {
        if let Some(window) = request.time_window {
            if let Err(current) = self.time_window.check(Some(&window)) {
                self.counters
                    .time_window_rejections
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(tx = %request.tx_id, %current, %window, "Rejected: outside time window");
                return Ok(CommitOutcome::TimeWindowInvalid { current, window });
            }
        }

        // A repeated input keeps its first position.
        let mut states = BTreeMap::new();
        for (index, state) in request.inputs.iter().enumerate() {
            states.entry(*state).or_insert(index as u32);
        }
        if states.is_empty() {
            return Ok(CommitOutcome::Committed);
        }

        match self
            .store
            .commit_all(request.tx_id, &states, &request.caller)?
        {
            CommitResult::Committed => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tx = %request.tx_id, inputs = states.len(), "Committed inputs");
                Ok(CommitOutcome::Committed)
            }
            CommitResult::AlreadyCommitted(existing) => {
                let retry = existing.len() == states.len()
                    && existing.values().all(|c| c.id == request.tx_id);
                if retry {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(tx = %request.tx_id, "Duplicate request for committed transaction");
                    return Ok(CommitOutcome::Committed);
                }

                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                let conflict = Conflict {
                    tx_id: request.tx_id,
                    states: existing
                        .into_iter()
                        .map(|(state_ref, consumed_by)| ConflictingState {
                            state_ref,
                            consumed_by,
                        })
                        .collect(),
                };
                tracing::info!(
                    tx = %request.tx_id,
                    contested = conflict.states.len(),
                    "Rejected: inputs already consumed"
                );
                Ok(CommitOutcome::Conflict(conflict))
            }
        }
    }
}
