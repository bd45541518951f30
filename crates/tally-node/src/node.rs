//! Node assembly: stores, services, protocols and the flow engine.

use crate::config::{NodeConfig, StorageBackend};
use crate::observability::MetricsState;
use crate::{NodeError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tally_flow::{FlowEngine, FlowHandle, FlowLogic, FlowRegistry, FlowStatus, ServiceHub};
use tally_identity::{IdentityService, KeyManagementService, PartyAndCertificate};
use tally_notary::{PersistentUniquenessProvider, TimeWindowChecker, UniquenessProvider};
use tally_protocols::{
    register_all, register_notary_service, AttachmentKind, ConfidentialIdentities,
    FetchAttachmentsFlow, FetchResult, NotarisationResponse, NotaryClientFlow, SwapIdentitiesFlow,
};
use tally_session::Transport;
use tally_storage::{
    CheckpointStore, CommitmentStore, MemoryCheckpointStore, MemoryCommitmentStore,
    MemoryRecordStore, RecordStore,
};
use tally_types::{Attachment, Clock, FlowId, PartyName, SecureHash, SystemClock, WireTransaction};

struct Stores {
    attachments: Arc<dyn RecordStore<Attachment>>,
    transactions: Arc<dyn RecordStore<WireTransaction>>,
    checkpoints: Arc<dyn CheckpointStore>,
    commitments: Arc<dyn CommitmentStore>,
}

impl Stores {
    fn open(config: &NodeConfig) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self {
                attachments: Arc::new(MemoryRecordStore::<Attachment>::new()),
                transactions: Arc::new(MemoryRecordStore::<WireTransaction>::new()),
                checkpoints: Arc::new(MemoryCheckpointStore::new()),
                commitments: Arc::new(MemoryCommitmentStore::new()),
            }),
            StorageBackend::Rocksdb => Self::open_rocksdb(config),
        }
    }

    #[cfg(feature = "rocksdb-backend")]
    fn open_rocksdb(config: &NodeConfig) -> Result<Self> {
        use tally_storage::{RocksDbConfig, RocksDbStorage};

        let path = config.storage.db_path(&config.data_dir);
        std::fs::create_dir_all(&path)?;
        let db = Arc::new(RocksDbStorage::open(RocksDbConfig {
            path,
            ..Default::default()
        })?);
        Ok(Self {
            attachments: db.clone(),
            transactions: db.clone(),
            checkpoints: db.clone(),
            commitments: db,
        })
    }

    #[cfg(not(feature = "rocksdb-backend"))]
    fn open_rocksdb(_config: &NodeConfig) -> Result<Self> {
        Err(NodeError::Config(
            "rocksdb storage requires the rocksdb-backend feature".into(),
        ))
    }
}

/// A running Tally node.
///
/// Owns the node's services and a [`FlowEngine`] wired to them. The engine
/// can be torn down and rebuilt over the same stores with
/// [`restart`](Node::restart), which is how crash recovery is exercised.
pub struct Node {
    config: NodeConfig,
    services: Arc<ServiceHub>,
    checkpoints: Arc<dyn CheckpointStore>,
    transport: Arc<dyn Transport>,
    metrics: MetricsState,
    engine: RwLock<FlowEngine>,
}

impl Node {
    /// Assembles a node. Flows do not run until [`start`](Node::start).
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Assembles a node reading time from `clock`.
    pub fn with_clock(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let name = config.party_name()?;
        if transport.local() != &name {
            return Err(NodeError::Config(format!(
                "transport belongs to {}, not {}",
                transport.local(),
                name
            )));
        }

        let keys = Arc::new(KeyManagementService::new(name, config.legal_key()?)?);
        let identities = Arc::new(IdentityService::new());
        identities.register_well_known(keys.legal_identity().clone())?;

        let stores = Stores::open(&config)?;
        let uniqueness = config.notary.then(|| {
            Arc::new(PersistentUniquenessProvider::new(
                stores.commitments.clone(),
                TimeWindowChecker::new(clock.clone()),
            )) as Arc<dyn UniquenessProvider>
        });

        let services = Arc::new(ServiceHub {
            keys,
            identities,
            attachments: stores.attachments,
            transactions: stores.transactions,
            clock,
            uniqueness,
        });

        let metrics = MetricsState::new();
        let engine = Self::build_engine(
            &config,
            &services,
            &stores.checkpoints,
            &transport,
            &metrics,
        );

        tracing::info!(
            party = %services.our_name(),
            notary = config.notary,
            storage = ?config.storage.backend,
            "Node assembled"
        );

        Ok(Self {
            config,
            services,
            checkpoints: stores.checkpoints,
            transport,
            metrics,
            engine: RwLock::new(engine),
        })
    }

    fn build_engine(
        config: &NodeConfig,
        services: &Arc<ServiceHub>,
        checkpoints: &Arc<dyn CheckpointStore>,
        transport: &Arc<dyn Transport>,
        metrics: &MetricsState,
    ) -> FlowEngine {
        let mut registry = FlowRegistry::new();
        register_all(&mut registry);
        if config.notary {
            register_notary_service(&mut registry);
        }
        FlowEngine::with_observer(
            services.clone(),
            registry,
            checkpoints.clone(),
            transport.clone(),
            config.session.clone(),
            Arc::new(metrics.clone()),
        )
    }

    /// Restores checkpointed flows and starts accepting sessions.
    ///
    /// Returns the number of flows restored.
    pub fn start(&self) -> Result<usize> {
        Ok(self.engine().start()?)
    }

    /// Stops the engine and starts a fresh one over the same stores.
    ///
    /// Suspended flows resume from their last checkpoint. Returns the number
    /// restored.
    pub fn restart(&self) -> Result<usize> {
        let fresh = Self::build_engine(
            &self.config,
            &self.services,
            &self.checkpoints,
            &self.transport,
            &self.metrics,
        );
        let previous = std::mem::replace(&mut *self.engine.write(), fresh);
        previous.shutdown();
        tracing::info!(party = %self.name(), "Restarting flow engine");
        self.start()
    }

    /// Stops every flow. Checkpoints are kept.
    pub fn shutdown(&self) {
        self.engine().shutdown();
        tracing::info!(party = %self.name(), "Node stopped");
    }

    /// The current engine.
    pub fn engine(&self) -> FlowEngine {
        self.engine.read().clone()
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node's services.
    pub fn services(&self) -> &Arc<ServiceHub> {
        &self.services
    }

    /// The node's legal name.
    pub fn name(&self) -> &PartyName {
        self.services.our_name()
    }

    /// The node's well-known identity, for distribution to peers.
    pub fn identity(&self) -> &PartyAndCertificate {
        self.services.keys.legal_identity()
    }

    /// Learns a peer's well-known identity.
    pub fn register_peer(&self, identity: PartyAndCertificate) -> Result<()> {
        self.services.identities.register_well_known(identity)?;
        Ok(())
    }

    /// Starts any registered flow.
    pub fn start_flow<F: FlowLogic>(&self, logic: F) -> Result<FlowHandle<F::Output>> {
        Ok(self.engine().start_flow(logic)?)
    }

    /// Exchanges fresh confidential identities with `counterparty`.
    pub async fn swap_identities(&self, counterparty: PartyName) -> Result<ConfidentialIdentities> {
        let handle = self.start_flow(SwapIdentitiesFlow::new(counterparty))?;
        Ok(handle.result().await?)
    }

    /// Stores an attachment locally and returns its id.
    pub fn import_attachment(&self, data: Vec<u8>) -> Result<SecureHash> {
        let attachment = Attachment::new(data);
        let id = attachment.id();
        if self.services.attachments.persist(attachment)? {
            tracing::info!(party = %self.name(), attachment = %id, "Imported attachment");
        }
        Ok(id)
    }

    /// Resolves attachments, downloading the missing ones from `from`.
    pub async fn fetch_attachments(
        &self,
        ids: Vec<SecureHash>,
        from: PartyName,
    ) -> Result<FetchResult<AttachmentKind>> {
        let handle = self.start_flow(FetchAttachmentsFlow::new(ids, from))?;
        Ok(handle.result().await?)
    }

    /// Asks the transaction's notary to sign it.
    ///
    /// A conflict or an invalid time window is a successful call returning
    /// [`NotarisationResponse::Error`].
    pub async fn notarise(&self, transaction: WireTransaction) -> Result<NotarisationResponse> {
        let handle = self.start_flow(NotaryClientFlow::new(transaction))?;
        let flow_id = handle.id();
        match handle.result().await {
            Ok(response) => {
                self.metrics.record_notarisation(response.outcome());
                tracing::info!(
                    party = %self.name(),
                    flow = %flow_id,
                    outcome = response.outcome(),
                    "Notarisation finished"
                );
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_notarisation("failed");
                Err(e.into())
            }
        }
    }

    /// Status of a flow, if the engine knows it.
    pub fn flow_status(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.engine().flow_status(flow_id)
    }

    /// Ids of flows that have not finished.
    pub fn running_flows(&self) -> Vec<FlowId> {
        self.engine().running_flows()
    }

    /// Kills a flow. Returns false if it is not running.
    pub fn kill_flow(&self, flow_id: &FlowId) -> bool {
        self.engine().kill_flow(flow_id)
    }

    /// The node's metrics.
    pub fn metrics(&self) -> &MetricsState {
        &self.metrics
    }

    /// Metrics in Prometheus text format.
    pub fn encode_metrics(&self) -> Result<String> {
        Ok(self.metrics.encode()?)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("party", self.name())
            .field("notary", &self.config.notary)
            .finish_non_exhaustive()
    }
}
