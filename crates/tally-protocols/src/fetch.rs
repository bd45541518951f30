//! Batch fetch of content-addressed records.
//!
//! [`FetchDataFlow`] resolves a set of ids against local storage first and asks
//! the counterparty for the misses in one batch. Every downloaded record is
//! re-hashed and compared with the id it was requested under; a single
//! mismatch fails the whole batch before anything is persisted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use tally_flow::{FlowContext, FlowError, FlowLogic, FlowResult, Received, ServiceHub, SessionRef, Step};
use tally_storage::Record;
use tally_types::{Attachment, PartyName, SecureHash, SerializedBytes, TransactionId, WireTransaction};

/// A kind of record that can be fetched from a counterparty.
pub trait FetchKind: Send + Sync + 'static {
    /// Record identifier.
    type Id: Clone + Ord + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// The record.
    type Record: Record<Id = Self::Id>;

    /// How a record travels over a session.
    type Wire: Serialize + DeserializeOwned;

    /// Flow name of the requesting side; also the session protocol.
    const FLOW: &'static str;

    /// Flow name of the serving side.
    const HANDLER: &'static str;

    /// Looks a record up in local storage.
    fn load_local(services: &ServiceHub, id: &Self::Id) -> FlowResult<Option<Self::Record>>;

    /// Stores a verified record. Storing an already present record is a no-op.
    fn persist_local(services: &ServiceHub, record: Self::Record) -> FlowResult<()>;

    /// Encodes a record for the wire.
    fn to_wire(record: Self::Record) -> Self::Wire;

    /// Decodes a record received from a counterparty.
    fn from_wire(wire: Self::Wire) -> FlowResult<Self::Record>;

    /// Recomputes a record's id from its content.
    fn compute_id(record: &Self::Record) -> FlowResult<Self::Id> {
        Ok(record.record_id()?)
    }
}

/// Attachments travel as their raw bytes; the id is the SHA-256 of the bytes.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentKind;

impl FetchKind for AttachmentKind {
    type Id = SecureHash;
    type Record = Attachment;
    type Wire = SerializedBytes;

    const FLOW: &'static str = "tally.fetch.attachment";
    const HANDLER: &'static str = "tally.fetch.attachment-handler";

    fn load_local(services: &ServiceHub, id: &SecureHash) -> FlowResult<Option<Attachment>> {
        Ok(services.attachments.load(id)?)
    }

    fn persist_local(services: &ServiceHub, record: Attachment) -> FlowResult<()> {
        services.attachments.persist(record)?;
        Ok(())
    }

    fn to_wire(record: Attachment) -> SerializedBytes {
        SerializedBytes::from_vec(record.into_data())
    }

    fn from_wire(wire: SerializedBytes) -> FlowResult<Attachment> {
        Ok(Attachment::new(wire.bytes().to_vec()))
    }
}

/// Transactions travel whole; the id is recomputed from their content.
#[derive(Debug, Clone, Copy)]
pub struct TransactionKind;

impl FetchKind for TransactionKind {
    type Id = TransactionId;
    type Record = WireTransaction;
    type Wire = WireTransaction;

    const FLOW: &'static str = "tally.fetch.transaction";
    const HANDLER: &'static str = "tally.fetch.transaction-handler";

    fn load_local(services: &ServiceHub, id: &TransactionId) -> FlowResult<Option<WireTransaction>> {
        Ok(services.transactions.load(id)?)
    }

    fn persist_local(services: &ServiceHub, record: WireTransaction) -> FlowResult<()> {
        services.transactions.persist(record)?;
        Ok(())
    }

    fn to_wire(record: WireTransaction) -> WireTransaction {
        record
    }

    fn from_wire(wire: WireTransaction) -> FlowResult<WireTransaction> {
        Ok(wire)
    }

    fn compute_id(record: &WireTransaction) -> FlowResult<TransactionId> {
        Ok(record.id()?)
    }
}

/// The ids a requester is missing.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FetchRequest<K: FetchKind> {
    /// Requested ids, in the order the records must be returned.
    pub ids: Vec<K::Id>,
}

/// Records resolved by a fetch.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FetchResult<K: FetchKind> {
    /// Found in local storage.
    pub from_disk: Vec<K::Record>,
    /// Downloaded, verified and persisted.
    pub downloaded: Vec<K::Record>,
}

impl<K: FetchKind> FetchResult<K> {
    /// Every resolved record.
    pub fn all(&self) -> impl Iterator<Item = &K::Record> {
        self.from_disk.iter().chain(self.downloaded.iter())
    }
}

impl<K: FetchKind> fmt::Debug for FetchResult<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResult")
            .field("kind", &K::FLOW)
            .field("from_disk", &self.from_disk.len())
            .field("downloaded", &self.downloaded.len())
            .finish()
    }
}

/// Fetches records of kind `K` from `other_side`, preferring local copies.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FetchDataFlow<K: FetchKind> {
    requests: BTreeSet<K::Id>,
    other_side: PartyName,
    #[serde(skip)]
    _kind: PhantomData<fn() -> K>,
}

impl<K: FetchKind> FetchDataFlow<K> {
    /// Creates the flow.
    pub fn new(requests: impl IntoIterator<Item = K::Id>, other_side: PartyName) -> Self {
        Self {
            requests: requests.into_iter().collect(),
            other_side,
            _kind: PhantomData,
        }
    }
}

impl<K: FetchKind> fmt::Debug for FetchDataFlow<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchDataFlow")
            .field("kind", &K::FLOW)
            .field("requests", &self.requests.len())
            .field("other_side", &self.other_side)
            .finish()
    }
}

/// Suspension point of [`FetchDataFlow`]: the batch request is out.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FetchState<K: FetchKind> {
    session: SessionRef,
    from_disk: Vec<K::Record>,
    requested: Vec<K::Id>,
}

impl<K: FetchKind> FlowLogic for FetchDataFlow<K> {
    const NAME: &'static str = K::FLOW;
    type State = FetchState<K>;
    type Output = FetchResult<K>;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<FetchState<K>, FetchResult<K>>> {
        let mut from_disk = Vec::new();
        let mut requested = Vec::new();
        for id in &self.requests {
            match K::load_local(ctx.services(), id)? {
                Some(record) => from_disk.push(record),
                None => requested.push(id.clone()),
            }
        }

        if requested.is_empty() {
            tracing::debug!(kind = K::FLOW, count = from_disk.len(), "All records found locally");
            return Ok(Step::Done(FetchResult {
                from_disk,
                downloaded: Vec::new(),
            }));
        }

        tracing::debug!(
            kind = K::FLOW,
            local = from_disk.len(),
            missing = requested.len(),
            from = %self.other_side,
            "Requesting missing records"
        );
        let session = ctx.initiate_flow(&self.other_side);
        let request = FetchRequest::<K> {
            ids: requested.clone(),
        };
        ctx.send_and_receive(
            session,
            &request,
            FetchState {
                session,
                from_disk,
                requested,
            },
        )
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: FetchState<K>,
        received: Received,
    ) -> FlowResult<Step<FetchState<K>, FetchResult<K>>> {
        let wire: Vec<K::Wire> = received.decode()?;
        if wire.len() != state.requested.len() {
            return Err(FlowError::Validation(format!(
                "requested {} records, received {}",
                state.requested.len(),
                wire.len()
            )));
        }

        let mut downloaded = Vec::with_capacity(wire.len());
        for (expected, item) in state.requested.iter().zip(wire) {
            let record = K::from_wire(item)?;
            let actual = K::compute_id(&record)?;
            if &actual != expected {
                tracing::warn!(
                    kind = K::FLOW,
                    from = %self.other_side,
                    expected = %expected,
                    actual = %actual,
                    "Downloaded record does not match its id"
                );
                return Err(FlowError::Validation(format!(
                    "hash mismatch: requested {}, received {}",
                    expected, actual
                )));
            }
            downloaded.push(record);
        }

        for record in &downloaded {
            K::persist_local(ctx.services(), record.clone())?;
        }
        tracing::info!(
            kind = K::FLOW,
            from = %self.other_side,
            downloaded = downloaded.len(),
            "Fetched records"
        );
        Ok(Step::Done(FetchResult {
            from_disk: state.from_disk,
            downloaded,
        }))
    }
}

/// Serves a [`FetchDataFlow`] from local storage.
///
/// If any requested record is missing the flow fails, which ends the
/// requester's session with an error report.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FetchDataHandler<K: FetchKind> {
    requester: PartyName,
    #[serde(skip)]
    _kind: PhantomData<fn() -> K>,
}

impl<K: FetchKind> FetchDataHandler<K> {
    /// Creates the responder for a session opened by `requester`.
    pub fn new(requester: PartyName) -> Self {
        Self {
            requester,
            _kind: PhantomData,
        }
    }
}

impl<K: FetchKind> FlowLogic for FetchDataHandler<K> {
    const NAME: &'static str = K::HANDLER;
    type State = SessionRef;
    type Output = usize;

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<SessionRef, usize>> {
        let session = ctx.initiating_session()?;
        ctx.receive(session, session)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        session: SessionRef,
        received: Received,
    ) -> FlowResult<Step<SessionRef, usize>> {
        let request: FetchRequest<K> = received.decode()?;
        let mut wire = Vec::with_capacity(request.ids.len());
        for id in &request.ids {
            let record = K::load_local(ctx.services(), id)?.ok_or_else(|| {
                FlowError::Validation(format!("{} does not have {}", ctx.services().our_name(), id))
            })?;
            wire.push(K::to_wire(record));
        }
        ctx.send(session, &wire)?;
        tracing::debug!(kind = K::FLOW, to = %self.requester, count = wire.len(), "Served records");
        Ok(Step::Done(wire.len()))
    }
}

/// Fetches attachments.
pub type FetchAttachmentsFlow = FetchDataFlow<AttachmentKind>;

/// Fetches transactions.
pub type FetchTransactionsFlow = FetchDataFlow<TransactionKind>;
