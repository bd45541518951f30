//! The commitment table: which transaction consumed which state.

use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tally_types::{PartyName, StateRef, TransactionId};

/// Default number of lock stripes.
pub(crate) const DEFAULT_STRIPES: usize = 64;

/// The transaction a state is bound to, and who asked for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumingTx {
    /// The consuming transaction.
    pub id: TransactionId,
    /// Position of the state among that transaction's inputs.
    pub input_index: u32,
    /// The party that requested the commitment.
    pub requesting_party: PartyName,
}

/// Result of an atomic multi-key commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// None of the states were bound; all are now bound to the transaction.
    Committed,
    /// At least one state was already bound; nothing was written.
    ///
    /// Holds every requested state that already had a binding.
    AlreadyCommitted(BTreeMap<StateRef, ConsumingTx>),
}

/// Append-only `StateRef -> ConsumingTx` table.
///
/// [`commit_all`](CommitmentStore::commit_all) is the only write path.
pub trait CommitmentStore: Send + Sync {
    /// Atomically binds every state in `states` to `tx_id`, or binds none.
    ///
    /// `states` maps each state to its position among the transaction's inputs.
    fn commit_all(
        &self,
        tx_id: TransactionId,
        states: &BTreeMap<StateRef, u32>,
        caller: &PartyName,
    ) -> Result<CommitResult>;

    /// Reads the binding of a single state.
    fn get(&self, state: &StateRef) -> Result<Option<ConsumingTx>>;

    /// Number of bound states.
    fn len(&self) -> Result<usize>;

    /// Returns true if nothing is bound yet.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Maps a state to its lock stripe.
pub(crate) fn stripe_of(state: &StateRef, stripes: usize) -> usize {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&state.txhash.as_bytes()[..8]);
    let mixed = u64::from_le_bytes(prefix) ^ u64::from(state.index).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed % stripes as u64) as usize
}

/// Distinct stripes touched by `states`, ascending so every caller locks in the same order.
pub(crate) fn stripes_for(states: &BTreeMap<StateRef, u32>, stripes: usize) -> Vec<usize> {
    states
        .keys()
        .map(|s| stripe_of(s, stripes))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// In-memory commitment table with striped locking.
///
/// Requests over disjoint stripes proceed in parallel; requests sharing a
/// stripe are serialized.
#[derive(Debug)]
pub struct MemoryCommitmentStore {
    shards: Vec<Mutex<HashMap<StateRef, ConsumingTx>>>,
}

impl Default for MemoryCommitmentStore {
    fn default() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }
}

impl MemoryCommitmentStore {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty table with a given number of lock stripes.
    pub fn with_stripes(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            shards: (0..stripes).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }
}

impl CommitmentStore for MemoryCommitmentStore {
    fn commit_all(
        &self,
        tx_id: TransactionId,
        states: &BTreeMap<StateRef, u32>,
        caller: &PartyName,
    ) -> Result<CommitResult> {
        let order = stripes_for(states, self.shards.len());
        let mut guards: HashMap<usize, _> = order
            .iter()
            .map(|&index| (index, self.shards[index].lock()))
            .collect();

        let mut existing = BTreeMap::new();
        for state in states.keys() {
            let shard = &guards[&stripe_of(state, self.shards.len())];
            if let Some(consumer) = shard.get(state) {
                existing.insert(*state, consumer.clone());
            }
        }
        if !existing.is_empty() {
            return Ok(CommitResult::AlreadyCommitted(existing));
        }

        for (state, input_index) in states {
            if let Some(shard) = guards.get_mut(&stripe_of(state, self.shards.len())) {
                shard.insert(
                    *state,
                    ConsumingTx {
                        id: tx_id,
                        input_index: *input_index,
                        requesting_party: caller.clone(),
                    },
                );
            }
        }
        Ok(CommitResult::Committed)
    }

    fn get(&self, state: &StateRef) -> Result<Option<ConsumingTx>> {
        let shard = &self.shards[stripe_of(state, self.shards.len())];
        Ok(shard.lock().get(state).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.shards.iter().map(|shard| shard.lock().len()).sum())
    }
}
