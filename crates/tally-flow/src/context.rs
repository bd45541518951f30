//! The view of the world a flow gets while it runs.

use crate::{FlowError, FlowResult, ServiceHub, SessionRef, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tally_identity::Party;
use tally_session::{Outbound, Payload, SessionChannel, SessionId};
use tally_types::{FlowId, PartyName};

/// The sessions owned by one flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SessionTable {
    next_index: u32,
    channels: BTreeMap<u32, SessionChannel>,
}

impl SessionTable {
    pub(crate) fn allocate(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    pub(crate) fn insert(&mut self, channel: SessionChannel) -> SessionRef {
        let index = channel.local().index;
        self.next_index = self.next_index.max(index + 1);
        self.channels.insert(index, channel);
        SessionRef(index)
    }

    pub(crate) fn get(&self, session: SessionRef) -> FlowResult<&SessionChannel> {
        self.channels
            .get(&session.0)
            .ok_or(FlowError::UnknownSession(session.0))
    }

    pub(crate) fn get_mut(&mut self, session: SessionRef) -> FlowResult<&mut SessionChannel> {
        self.channels
            .get_mut(&session.0)
            .ok_or(FlowError::UnknownSession(session.0))
    }

    /// Looks up the channel a received frame is addressed to.
    pub(crate) fn by_local_id(&mut self, local: SessionId) -> Option<&mut SessionChannel> {
        self.channels
            .get_mut(&local.index)
            .filter(|channel| channel.local() == local)
    }

    pub(crate) fn channels_mut(&mut self) -> impl Iterator<Item = &mut SessionChannel> {
        self.channels.values_mut()
    }

    pub(crate) fn channels(&self) -> impl Iterator<Item = &SessionChannel> {
        self.channels.values()
    }
}

/// Capabilities handed to flow logic between suspension points.
///
/// Sends are only queued here; the engine transmits them after the next
/// checkpoint is written.
pub struct FlowContext<'a> {
    flow_id: FlowId,
    protocol: &'static str,
    services: &'a ServiceHub,
    sessions: &'a mut SessionTable,
    outbound: &'a mut Vec<Outbound>,
    initiating: Option<SessionRef>,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(
        flow_id: FlowId,
        protocol: &'static str,
        services: &'a ServiceHub,
        sessions: &'a mut SessionTable,
        outbound: &'a mut Vec<Outbound>,
        initiating: Option<SessionRef>,
    ) -> Self {
        Self {
            flow_id,
            protocol,
            services,
            sessions,
            outbound,
            initiating,
        }
    }

    /// Id of the running flow.
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Node services.
    pub fn services(&self) -> &ServiceHub {
        self.services
    }

    /// This node's legal identity.
    pub fn our_identity(&self) -> Party {
        self.services.our_identity()
    }

    /// For responder flows, the session that started this flow.
    pub fn initiating_session(&self) -> FlowResult<SessionRef> {
        self.initiating.ok_or_else(|| {
            FlowError::UnexpectedMessage(format!("{} was not started by a counterparty", self.protocol))
        })
    }

    /// Opens a session to `party` speaking this flow's protocol.
    pub fn initiate_flow(&mut self, party: &PartyName) -> SessionRef {
        let protocol = self.protocol;
        self.initiate_flow_with_protocol(party, protocol)
    }

    /// Opens a session to `party` speaking an explicit protocol.
    pub fn initiate_flow_with_protocol(&mut self, party: &PartyName, protocol: &str) -> SessionRef {
        let local = SessionId::new(self.flow_id, self.sessions.allocate());
        tracing::debug!(flow = %self.flow_id, to = %party, protocol, "Initiating session");
        self.sessions
            .insert(SessionChannel::initiate(local, party.clone(), protocol))
    }

    /// The counterparty of a session.
    pub fn counterparty(&self, session: SessionRef) -> FlowResult<PartyName> {
        Ok(self.sessions.get(session)?.counterparty().clone())
    }

    /// Queues a message on a session.
    pub fn send<T: Serialize>(&mut self, session: SessionRef, message: &T) -> FlowResult<()> {
        let payload = Payload::of(message)?;
        let channel = self.sessions.get_mut(session)?;
        if let Some(outbound) = channel.send(payload)? {
            self.outbound.push(outbound);
        }
        Ok(())
    }

    /// Suspends until a message arrives on `session`.
    pub fn receive<S, O>(&mut self, session: SessionRef, state: S) -> FlowResult<Step<S, O>> {
        let channel = self.sessions.get_mut(session)?;
        if let Some(init) = channel.ensure_init() {
            self.outbound.push(init);
        }
        Ok(Step::Receive { session, state })
    }

    /// Sends `message` then suspends until the reply arrives.
    pub fn send_and_receive<T: Serialize, S, O>(
        &mut self,
        session: SessionRef,
        message: &T,
        state: S,
    ) -> FlowResult<Step<S, O>> {
        self.send(session, message)?;
        self.receive(session, state)
    }

    /// Ends a session from this side. The counterparty observes `SessionEnded`
    /// if it still waits on it.
    pub fn close_session(&mut self, session: SessionRef) -> FlowResult<()> {
        if let Some(end) = self.sessions.get_mut(session)?.end(None) {
            self.outbound.push(end);
        }
        Ok(())
    }
}
