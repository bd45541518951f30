//! The transport seam and an in-memory network.

use crate::{Result, SessionError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tally_types::PartyName;
use tokio::sync::Notify;

/// At-least-once delivery of frames between named parties.
///
/// Frames from one sender to one recipient arrive in send order, possibly
/// more than once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The party this endpoint belongs to.
    fn local(&self) -> &PartyName;

    /// Hands a frame to the network.
    async fn send(&self, to: &PartyName, frame: Bytes) -> Result<()>;

    /// Waits for the next inbound frame. Returns `None` once the endpoint is closed.
    async fn recv(&self) -> Option<(PartyName, Bytes)>;
}

#[derive(Debug, Default)]
struct Inbox {
    queue: Mutex<VecDeque<(PartyName, Bytes)>>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct NetworkInner {
    inboxes: RwLock<HashMap<PartyName, Arc<Inbox>>>,
    disconnected: RwLock<HashSet<PartyName>>,
    duplication: AtomicU32,
}

/// An in-process network connecting any number of parties.
///
/// Inboxes outlive individual endpoints, so a node that is torn down and
/// rebuilt on the same network picks up frames addressed to it while it was
/// down. Faults can be injected: every frame can be duplicated, and parties
/// can be disconnected.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint for `party`, creating its inbox if needed.
    pub fn join(&self, party: PartyName) -> MemoryTransport {
        let inbox = self
            .inner
            .inboxes
            .write()
            .entry(party.clone())
            .or_default()
            .clone();
        tracing::debug!(party = %party, "Joined memory network");
        MemoryTransport {
            local: party,
            inbox,
            network: self.clone(),
        }
    }

    /// Delivers every frame `1 + extra_copies` times.
    pub fn set_duplication(&self, extra_copies: u32) {
        self.inner.duplication.store(extra_copies, Ordering::SeqCst);
    }

    /// Makes every send to or from `party` fail.
    pub fn disconnect(&self, party: &PartyName) {
        self.inner.disconnected.write().insert(party.clone());
    }

    /// Restores connectivity for `party`.
    pub fn reconnect(&self, party: &PartyName) {
        self.inner.disconnected.write().remove(party);
    }

    /// Frames waiting in `party`'s inbox.
    pub fn pending(&self, party: &PartyName) -> usize {
        self.inner
            .inboxes
            .read()
            .get(party)
            .map(|inbox| inbox.queue.lock().len())
            .unwrap_or(0)
    }

    fn deliver(&self, from: &PartyName, to: &PartyName, frame: Bytes) -> Result<()> {
        {
            let disconnected = self.inner.disconnected.read();
            if disconnected.contains(from) {
                return Err(SessionError::Disconnected(from.clone()));
            }
            if disconnected.contains(to) {
                return Err(SessionError::Disconnected(to.clone()));
            }
        }
        let inbox = self
            .inner
            .inboxes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| SessionError::UnknownPeer(to.clone()))?;
        let copies = 1 + self.inner.duplication.load(Ordering::SeqCst);
        {
            let mut queue = inbox.queue.lock();
            for _ in 0..copies {
                queue.push_back((from.clone(), frame.clone()));
            }
        }
        inbox.notify.notify_one();
        Ok(())
    }
}

/// One party's endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: PartyName,
    inbox: Arc<Inbox>,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local(&self) -> &PartyName {
        &self.local
    }

    async fn send(&self, to: &PartyName, frame: Bytes) -> Result<()> {
        self.network.deliver(&self.local, to, frame)
    }

    async fn recv(&self) -> Option<(PartyName, Bytes)> {
        loop {
            if let Some(item) = self.inbox.queue.lock().pop_front() {
                return Some(item);
            }
            self.inbox.notify.notified().await;
        }
    }
}
