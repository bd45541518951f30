//! The flow engine.
//!
//! One router task takes frames off the transport and dispatches them: Init
//! frames create responder flows, everything else goes to the mailbox of the
//! addressed flow. Each flow runs in its own driver task, so a flow never has
//! two continuations executing at once, while different flows run in
//! parallel.
//!
//! At every suspension the driver writes the checkpoint first, then transmits
//! queued frames, then waits. A crash at any point therefore either replays
//! from the previous checkpoint (nothing was sent yet) or retransmits frames
//! the peer will discard as duplicates.

use crate::checkpoint::{Awaiting, Checkpoint};
use crate::context::SessionTable;
use crate::registry::{ErasedFlow, ErasedStep, Typed};
use crate::{
    Direction, FlowContext, FlowError, FlowEvent, FlowHandle, FlowLogic, FlowObserver,
    FlowRegistry, FlowResult, FlowStatus, NoopObserver, Received, ServiceHub,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tally_session::{
    Delivery, Outbound, SessionChannel, SessionConfig, SessionId, SessionMessage,
    SessionTermination, Transport, WireOutcome,
};
use tally_storage::CheckpointStore;
use tally_types::{FlowId, PartyName};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Finished flows whose status stays queryable. Older ones are forgotten.
pub const FINISHED_RETENTION: usize = 128;

type InitKey = (PartyName, SessionId);

enum Mail {
    Message(PartyName, SessionMessage),
    Kill,
}

struct EngineInner {
    services: Arc<ServiceHub>,
    registry: RwLock<FlowRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    observer: Arc<dyn FlowObserver>,
    mailboxes: RwLock<HashMap<FlowId, mpsc::UnboundedSender<Mail>>>,
    statuses: RwLock<HashMap<FlowId, watch::Sender<FlowStatus>>>,
    /// Initiator session -> our responder session, so duplicate Inits are ignored.
    inits: Mutex<HashMap<InitKey, SessionId>>,
    /// Finished flows, oldest first, with the Init they answered.
    finished: Mutex<VecDeque<(FlowId, Option<InitKey>)>>,
    drivers: Mutex<HashMap<FlowId, AbortHandle>>,
    router: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<FlowEvent>,
}

/// Runs flows for one node.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    /// Creates an engine. Nothing runs until [`start`](Self::start).
    pub fn new(
        services: Arc<ServiceHub>,
        registry: FlowRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self::with_observer(
            services,
            registry,
            checkpoints,
            transport,
            config,
            Arc::new(NoopObserver),
        )
    }

    /// Creates an engine reporting to `observer`.
    pub fn with_observer(
        services: Arc<ServiceHub>,
        registry: FlowRegistry,
        checkpoints: Arc<dyn CheckpointStore>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        observer: Arc<dyn FlowObserver>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(EngineInner {
                services,
                registry: RwLock::new(registry),
                checkpoints,
                transport,
                config,
                observer,
                mailboxes: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                inits: Mutex::new(HashMap::new()),
                finished: Mutex::new(VecDeque::new()),
                drivers: Mutex::new(HashMap::new()),
                router: Mutex::new(None),
                events,
            }),
        }
    }

    /// Restores checkpointed flows, then starts routing inbound frames.
    ///
    /// Returns the number of flows restored.
    pub fn start(&self) -> FlowResult<usize> {
        let restored = self.inner.restore()?;
        let router = tokio::spawn(self.inner.clone().route());
        if let Some(previous) = self.inner.router.lock().replace(router) {
            previous.abort();
        }
        tracing::info!(
            party = %self.inner.services.our_name(),
            restored,
            "Flow engine started"
        );
        Ok(restored)
    }

    /// Starts a flow on this node.
    ///
    /// The initial checkpoint is durable before this returns.
    pub fn start_flow<F: FlowLogic>(&self, logic: F) -> FlowResult<FlowHandle<F::Output>> {
        self.inner.registry.write().register::<F>();
        let flow_id = FlowId::random();
        let checkpoint = Checkpoint::new(flow_id, F::NAME, serde_json::to_value(&logic)?);
        self.inner.checkpoints.save(flow_id, checkpoint.encode()?)?;
        let status = self.inner.spawn_flow(Box::new(Typed(logic)), checkpoint);
        Ok(FlowHandle::new(flow_id, status))
    }

    /// A typed handle to an existing flow, e.g. one restored from a checkpoint.
    pub fn handle<T: serde::de::DeserializeOwned>(&self, flow_id: FlowId) -> Option<FlowHandle<T>> {
        let status = self.inner.statuses.read().get(&flow_id)?.subscribe();
        Some(FlowHandle::new(flow_id, status))
    }

    /// Current status of a flow.
    ///
    /// Only the last [`FINISHED_RETENTION`] finished flows are remembered.
    pub fn flow_status(&self, flow_id: &FlowId) -> Option<FlowStatus> {
        self.inner
            .statuses
            .read()
            .get(flow_id)
            .map(|status| status.borrow().clone())
    }

    /// Ids of flows that have not finished.
    pub fn running_flows(&self) -> Vec<FlowId> {
        let mut flows: Vec<_> = self.inner.mailboxes.read().keys().copied().collect();
        flows.sort();
        flows
    }

    /// Asks a flow to terminate. Its counterparties are told it failed.
    ///
    /// Returns false if the flow is not running.
    pub fn kill_flow(&self, flow_id: &FlowId) -> bool {
        let killed = self
            .inner
            .mailboxes
            .read()
            .get(flow_id)
            .map(|mailbox| mailbox.send(Mail::Kill).is_ok())
            .unwrap_or(false);
        if killed {
            tracing::info!(flow = %flow_id, "Kill requested");
        }
        killed
    }

    /// Number of flows whose status is still held, running or finished.
    pub fn known_flows(&self) -> usize {
        self.inner.statuses.read().len()
    }

    /// Number of counterparty Inits remembered for duplicate detection.
    pub fn known_initiations(&self) -> usize {
        self.inner.inits.lock().len()
    }

    /// Subscribes to flow lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    /// Registered responder protocols.
    pub fn protocols(&self) -> Vec<String> {
        self.inner.registry.read().protocols()
    }

    /// Node services.
    pub fn services(&self) -> &Arc<ServiceHub> {
        &self.inner.services
    }

    /// Stops every task immediately, leaving checkpoints in place.
    ///
    /// A new engine over the same checkpoint store resumes the stopped flows.
    pub fn shutdown(&self) {
        if let Some(router) = self.inner.router.lock().take() {
            router.abort();
        }
        for (_, driver) in self.inner.drivers.lock().drain() {
            driver.abort();
        }
        self.inner.mailboxes.write().clear();
        self.inner.statuses.write().clear();
        self.inner.finished.lock().clear();
        tracing::info!(party = %self.inner.services.our_name(), "Flow engine stopped");
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("party", self.inner.services.our_name())
            .field("running", &self.inner.mailboxes.read().len())
            .finish()
    }
}

impl EngineInner {
    fn restore(self: &Arc<Self>) -> FlowResult<usize> {
        let mut restored = 0;
        for (flow_id, bytes) in self.checkpoints.load_all()? {
            if self.mailboxes.read().contains_key(&flow_id) {
                continue;
            }
            let checkpoint = match Checkpoint::decode(&bytes) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    tracing::error!(flow = %flow_id, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
            };
            let flow = match self
                .registry
                .read()
                .restore(&checkpoint.flow_name, checkpoint.logic.clone())
            {
                Ok(flow) => flow,
                Err(e) => {
                    tracing::error!(flow = %flow_id, error = %e, "Cannot restore flow");
                    continue;
                }
            };
            if let Some(channel) = checkpoint
                .initiating
                .and_then(|session| checkpoint.sessions.get(session).ok())
            {
                if let Some(peer) = channel.peer_session() {
                    self.inits
                        .lock()
                        .insert((channel.counterparty().clone(), peer), channel.local());
                }
            }
            tracing::info!(flow = %flow_id, name = %checkpoint.flow_name, "Restoring flow");
            self.spawn_flow(flow, checkpoint);
            restored += 1;
        }
        Ok(restored)
    }

    fn spawn_flow(
        self: &Arc<Self>,
        flow: Box<dyn ErasedFlow>,
        checkpoint: Checkpoint,
    ) -> watch::Receiver<FlowStatus> {
        let flow_id = checkpoint.flow_id;
        let (mail_tx, mail_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(FlowStatus::Running);
        self.mailboxes.write().insert(flow_id, mail_tx);
        self.statuses.write().insert(flow_id, status_tx);

        self.observer.flow_started(flow.name());
        let _ = self.events.send(FlowEvent::Started {
            flow_id,
            name: flow.name().to_string(),
            initiated_by: checkpoint.initiated_by.clone(),
        });

        let driver = FlowDriver {
            engine: self.clone(),
            flow,
            checkpoint,
            mailbox: mail_rx,
        };
        let mut drivers = self.drivers.lock();
        let task = tokio::spawn(driver.run());
        drivers.insert(flow_id, task.abort_handle());
        status_rx
    }

    async fn route(self: Arc<Self>) {
        while let Some((from, frame)) = self.transport.recv().await {
            let message = match SessionMessage::decode(&frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(from = %from, error = %e, "Dropping undecodable frame");
                    continue;
                }
            };
            self.observer
                .session_message(Direction::Received, message.kind());

            match message {
                SessionMessage::Init {
                    initiator_session,
                    protocol,
                    first_payload,
                } => {
                    self.on_init(from, initiator_session, protocol, first_payload)
                        .await
                }
                other => {
                    let Some(flow_id) = other.target_flow() else {
                        continue;
                    };
                    let mailbox = self.mailboxes.read().get(&flow_id).cloned();
                    match mailbox {
                        Some(mailbox) => {
                            let _ = mailbox.send(Mail::Message(from, other));
                        }
                        None => tracing::debug!(
                            flow = %flow_id,
                            kind = other.kind(),
                            "Dropping frame for finished flow"
                        ),
                    }
                }
            }
        }
    }

    async fn on_init(
        self: &Arc<Self>,
        from: PartyName,
        initiator_session: SessionId,
        protocol: String,
        first_payload: Option<tally_session::Payload>,
    ) {
        let key = (from.clone(), initiator_session);
        if self.inits.lock().contains_key(&key) {
            self.observer.duplicate_dropped();
            tracing::debug!(from = %from, session = %initiator_session, "Duplicate Init");
            return;
        }

        let responder = self.registry.read().responder(&protocol, &from);
        let Some(flow) = responder else {
            tracing::warn!(from = %from, protocol = %protocol, "No responder registered; rejecting");
            let reject = Outbound {
                to: from.clone(),
                message: SessionMessage::Reject {
                    initiator_session,
                    reason: format!("no responder registered for {}", protocol),
                },
            };
            if let Err(e) = self.transmit(&reject, false).await {
                tracing::warn!(to = %from, error = %e, "Failed to send Reject");
            }
            return;
        };

        let flow_id = FlowId::random();
        let local = SessionId::new(flow_id, 0);
        let (channel, confirm) =
            SessionChannel::accept(local, from.clone(), protocol.clone(), initiator_session, first_payload);
        let logic = match flow.logic() {
            Ok(logic) => logic,
            Err(e) => {
                tracing::error!(protocol = %protocol, error = %e, "Responder logic not serializable");
                return;
            }
        };

        let mut checkpoint = Checkpoint::new(flow_id, flow.name(), logic);
        checkpoint.initiated_by = Some(from.clone());
        checkpoint.initiating = Some(checkpoint.sessions.insert(channel));
        checkpoint.pending.push(confirm);

        let saved = checkpoint
            .encode()
            .and_then(|bytes| self.checkpoints.save(flow_id, bytes).map_err(FlowError::from));
        if let Err(e) = saved {
            tracing::error!(from = %from, error = %e, "Cannot checkpoint responder; dropping Init");
            return;
        }
        self.inits.lock().insert(key, local);
        tracing::debug!(from = %from, protocol = %protocol, flow = %flow_id, "Responder flow created");
        self.spawn_flow(flow, checkpoint);
    }

    /// Hands a frame to the transport, retrying per policy when `retry` is set.
    async fn transmit(&self, outbound: &Outbound, retry: bool) -> FlowResult<()> {
        let frame = outbound.message.encode()?;
        let to = &outbound.to;
        let result = if retry {
            self.config
                .retry
                .execute(|| self.transport.send(to, frame.clone()))
                .await
        } else {
            self.transport.send(to, frame).await.map_err(|e| (e, 1))
        };
        match result {
            Ok(()) => {
                self.observer
                    .session_message(Direction::Sent, outbound.message.kind());
                Ok(())
            }
            Err((e, attempts)) => {
                tracing::warn!(to = %to, attempts, error = %e, "Session broken");
                Err(FlowError::SessionBroken(to.clone()))
            }
        }
    }

    fn set_status(&self, flow_id: &FlowId, status: FlowStatus) {
        if let Some(sender) = self.statuses.read().get(flow_id) {
            sender.send_replace(status);
        }
    }

    /// Remembers a finished flow, forgetting the oldest beyond the retention limit.
    ///
    /// Handles already held keep the final status after eviction.
    fn retire(&self, flow_id: FlowId, init: Option<InitKey>) {
        let mut finished = self.finished.lock();
        finished.push_back((flow_id, init));
        while finished.len() > FINISHED_RETENTION {
            let Some((old, init)) = finished.pop_front() else {
                break;
            };
            self.statuses.write().remove(&old);
            if let Some(key) = init {
                self.inits.lock().remove(&key);
            }
        }
    }
}

struct FlowDriver {
    engine: Arc<EngineInner>,
    flow: Box<dyn ErasedFlow>,
    checkpoint: Checkpoint,
    mailbox: mpsc::UnboundedReceiver<Mail>,
}

fn termination_error(party: &PartyName, termination: SessionTermination) -> FlowError {
    match termination {
        SessionTermination::Ended(Some(report)) => FlowError::CounterpartyFailed {
            party: party.clone(),
            report,
        },
        SessionTermination::Ended(None) | SessionTermination::Closed => {
            FlowError::SessionEnded(party.clone())
        }
        SessionTermination::Rejected(reason) => FlowError::SessionRejected {
            party: party.clone(),
            reason,
        },
    }
}

impl FlowDriver {
    async fn run(mut self) {
        let result = self.drive().await;
        self.finish(result).await;
    }

    async fn drive(&mut self) -> FlowResult<Value> {
        let flow_id = self.checkpoint.flow_id;
        let mut deadline: Option<Instant> = None;

        loop {
            if let Some(step) = self.advance()? {
                deadline = None;
                match step {
                    ErasedStep::Done(output) => return Ok(output),
                    ErasedStep::Receive { session, state } => {
                        self.checkpoint.awaiting = Awaiting::Receive { session, state };
                    }
                    ErasedStep::Sleep { until, state } => {
                        self.checkpoint.awaiting = Awaiting::Sleep { until, state };
                    }
                }
                continue;
            }

            self.persist()?;
            self.flush(true).await?;
            self.engine.set_status(&flow_id, FlowStatus::Suspended);

            let wake_at = match &self.checkpoint.awaiting {
                Awaiting::Sleep { until, .. } => {
                    let now = self.engine.services.clock.now();
                    Instant::now()
                        + Duration::from_millis(until.as_millis().saturating_sub(now.as_millis()))
                }
                _ => *deadline
                    .get_or_insert_with(|| Instant::now() + self.engine.config.receive_timeout),
            };

            match tokio::time::timeout_at(wake_at, self.mailbox.recv()).await {
                Ok(Some(Mail::Message(from, message))) => {
                    self.engine.set_status(&flow_id, FlowStatus::Running);
                    self.on_message(from, message);
                }
                Ok(Some(Mail::Kill)) => return Err(FlowError::Killed),
                Ok(None) => return Err(FlowError::EngineStopped),
                Err(_) => {
                    if let Awaiting::Receive { session, .. } = &self.checkpoint.awaiting {
                        let party = self.checkpoint.sessions.get(*session)?.counterparty().clone();
                        tracing::warn!(flow = %flow_id, party = %party, "Receive timed out");
                        return Err(FlowError::CounterpartyUnresponsive(party));
                    }
                }
            }
        }
    }

    /// Runs logic until it needs something that has not happened yet.
    fn advance(&mut self) -> FlowResult<Option<ErasedStep>> {
        let services = &*self.engine.services;
        let flow = &self.flow;
        let cp = &mut self.checkpoint;

        let step = match &cp.awaiting {
            Awaiting::Start => {
                let mut ctx = FlowContext::new(
                    cp.flow_id,
                    flow.name(),
                    services,
                    &mut cp.sessions,
                    &mut cp.pending,
                    cp.initiating,
                );
                flow.start(&mut ctx)?
            }
            Awaiting::Receive { session, state } => {
                let channel = cp.sessions.get_mut(*session)?;
                let payload = match channel.take_next() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return Ok(None),
                    Err(termination) => {
                        return Err(termination_error(channel.counterparty(), termination))
                    }
                };
                let received = Received {
                    session: *session,
                    payload,
                };
                let state = state.clone();
                let mut ctx = FlowContext::new(
                    cp.flow_id,
                    flow.name(),
                    services,
                    &mut cp.sessions,
                    &mut cp.pending,
                    cp.initiating,
                );
                flow.resume(&mut ctx, state, received)?
            }
            Awaiting::Sleep { until, state } => {
                if services.clock.now() < *until {
                    return Ok(None);
                }
                let state = state.clone();
                let mut ctx = FlowContext::new(
                    cp.flow_id,
                    flow.name(),
                    services,
                    &mut cp.sessions,
                    &mut cp.pending,
                    cp.initiating,
                );
                flow.wake(&mut ctx, state)?
            }
        };
        Ok(Some(step))
    }

    fn on_message(&mut self, from: PartyName, message: SessionMessage) {
        let flow_id = self.checkpoint.flow_id;
        let sessions: &mut SessionTable = &mut self.checkpoint.sessions;
        let (local, kind) = match &message {
            SessionMessage::Confirm {
                initiator_session, ..
            }
            | SessionMessage::Reject {
                initiator_session, ..
            } => (*initiator_session, message.kind()),
            SessionMessage::Data {
                recipient_session, ..
            }
            | SessionMessage::End {
                recipient_session, ..
            } => (*recipient_session, message.kind()),
            SessionMessage::Init { .. } => return,
        };
        let Some(channel) = sessions.by_local_id(local) else {
            tracing::warn!(flow = %flow_id, session = %local, kind, "Frame for unknown session");
            return;
        };
        if channel.counterparty() != &from {
            tracing::warn!(flow = %flow_id, from = %from, kind, "Frame from wrong party");
            return;
        }

        let outcome = match message {
            SessionMessage::Confirm {
                responder_session, ..
            } => {
                let flushed = channel.on_confirm(responder_session);
                self.checkpoint.pending.extend(flushed);
                WireOutcome::Accepted
            }
            SessionMessage::Reject { reason, .. } => {
                channel.on_reject(reason);
                WireOutcome::Accepted
            }
            SessionMessage::Data { seq, payload, .. } => channel.on_wire(seq, Delivery::Data(payload)),
            SessionMessage::End { seq, error, .. } => channel.on_wire(seq, Delivery::End(error)),
            SessionMessage::Init { .. } => WireOutcome::Duplicate,
        };
        match outcome {
            WireOutcome::Accepted => {}
            WireOutcome::Duplicate => {
                self.engine.observer.duplicate_dropped();
                tracing::trace!(flow = %flow_id, session = %local, kind, "Duplicate frame dropped");
            }
            WireOutcome::OutOfWindow => {
                tracing::warn!(flow = %flow_id, session = %local, kind, "Frame beyond reorder window dropped");
            }
        }
    }

    fn persist(&self) -> FlowResult<()> {
        let bytes = self.checkpoint.encode()?;
        self.engine
            .checkpoints
            .save(self.checkpoint.flow_id, bytes)?;
        Ok(())
    }

    /// Transmits queued frames in order.
    async fn flush(&mut self, retry: bool) -> FlowResult<()> {
        while let Some(outbound) = self.checkpoint.pending.first().cloned() {
            self.engine.transmit(&outbound, retry).await?;
            self.checkpoint.pending.remove(0);
        }
        Ok(())
    }

    async fn finish(mut self, result: FlowResult<Value>) {
        let flow_id = self.checkpoint.flow_id;
        let name = self.flow.name();

        // Not finished: the checkpoint stays so a restarted engine resumes it.
        if let Err(FlowError::EngineStopped) = result {
            tracing::debug!(flow = %flow_id, name, "Flow detached from stopped engine");
            self.engine.drivers.lock().remove(&flow_id);
            return;
        }

        let report = result.as_ref().err().map(FlowError::report);
        for channel in self.checkpoint.sessions.channels_mut() {
            if let Some(end) = channel.end(report.clone()) {
                self.checkpoint.pending.push(end);
            }
        }
        let unconfirmed = self
            .checkpoint
            .sessions
            .channels()
            .filter(|c| c.peer_session().is_none())
            .count();
        if unconfirmed > 0 {
            tracing::debug!(flow = %flow_id, unconfirmed, "Sessions closed before confirmation");
        }
        // After a failure the transport may be the problem; one attempt each.
        if let Err(e) = self.flush(result.is_ok()).await {
            tracing::warn!(flow = %flow_id, error = %e, "Could not notify all counterparties");
        }
        if let Err(e) = self.engine.checkpoints.remove(&flow_id) {
            tracing::error!(flow = %flow_id, error = %e, "Failed to remove checkpoint");
        }

        self.engine.mailboxes.write().remove(&flow_id);
        let init = self
            .checkpoint
            .initiating
            .and_then(|session| self.checkpoint.sessions.get(session).ok())
            .and_then(|channel| Some((channel.counterparty().clone(), channel.peer_session()?)));
        match result {
            Ok(output) => {
                tracing::info!(flow = %flow_id, name, "Flow completed");
                self.engine.observer.flow_finished(name, None);
                self.engine
                    .set_status(&flow_id, FlowStatus::Completed(output));
                let _ = self.engine.events.send(FlowEvent::Completed {
                    flow_id,
                    name: name.to_string(),
                });
            }
            Err(error) => {
                tracing::warn!(flow = %flow_id, name, error = %error, "Flow failed");
                self.engine.observer.flow_finished(name, Some(&error));
                self.engine
                    .set_status(&flow_id, FlowStatus::Failed(error.clone()));
                let _ = self.engine.events.send(FlowEvent::Failed {
                    flow_id,
                    name: name.to_string(),
                    error,
                });
            }
        }
        self.engine.retire(flow_id, init);
        self.engine.drivers.lock().remove(&flow_id);
    }
}
