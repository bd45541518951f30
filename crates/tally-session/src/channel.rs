//! The per-session state machine.
//!
//! [`SessionChannel`] performs no I/O. Every operation returns the frames the
//! caller must transmit, and the whole channel is serializable so it can be
//! stored inside a flow checkpoint.

use crate::{ErrorReport, Payload, Result, SessionError, SessionId, SessionMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tally_types::PartyName;

/// How far past the next expected sequence number a frame may arrive.
///
/// Frames further ahead are refused rather than buffered.
pub const REORDER_WINDOW: u64 = 256;

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Sent the Init.
    Initiator,
    /// Was created by an Init.
    Responder,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Initiator waiting for Confirm.
    Initiating,
    /// Both ends known.
    Open,
    /// The counterparty ended the session and its End has been consumed.
    Ended {
        /// Error relayed by the counterparty, if its flow failed.
        error: Option<ErrorReport>,
    },
    /// The counterparty refused the session.
    Rejected {
        /// Reason given.
        reason: String,
    },
    /// This side closed the session.
    Closed,
}

/// An in-order item delivered to the owning flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    /// A payload.
    Data(Payload),
    /// The counterparty finished with the session.
    End(Option<ErrorReport>),
}

/// A frame to transmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    /// Recipient party.
    pub to: PartyName,
    /// The frame.
    pub message: SessionMessage,
}

/// Result of feeding a sequenced frame into the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOutcome {
    /// First sighting; queued for delivery.
    Accepted,
    /// Already seen; dropped.
    Duplicate,
    /// Too far ahead of the next expected frame; dropped.
    OutOfWindow,
}

/// Why a channel can no longer deliver payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTermination {
    /// The counterparty ended the session, optionally because its flow failed.
    Ended(Option<ErrorReport>),
    /// The counterparty refused the session.
    Rejected(String),
    /// This side already closed the session.
    Closed,
}

/// One end of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionChannel {
    local: SessionId,
    peer_session: Option<SessionId>,
    counterparty: PartyName,
    protocol: String,
    role: Role,
    state: ChannelState,
    init_sent: bool,
    next_send_seq: u64,
    next_recv_seq: u64,
    /// Out-of-order arrivals keyed by sequence number.
    reorder: BTreeMap<u64, Delivery>,
    /// In-order items not yet consumed by the flow.
    ready: VecDeque<Delivery>,
    /// Frames sent before Confirm, flushed once the peer session is known.
    unconfirmed: Vec<(u64, Delivery)>,
}

impl SessionChannel {
    /// Creates the initiating end. Nothing is sent until the first send or receive.
    pub fn initiate(local: SessionId, counterparty: PartyName, protocol: impl Into<String>) -> Self {
        Self {
            local,
            peer_session: None,
            counterparty,
            protocol: protocol.into(),
            role: Role::Initiator,
            state: ChannelState::Initiating,
            init_sent: false,
            next_send_seq: 0,
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            unconfirmed: Vec::new(),
        }
    }

    /// Creates the responding end from an Init, returning the Confirm to send.
    pub fn accept(
        local: SessionId,
        counterparty: PartyName,
        protocol: impl Into<String>,
        initiator_session: SessionId,
        first_payload: Option<Payload>,
    ) -> (Self, Outbound) {
        let mut channel = Self {
            local,
            peer_session: Some(initiator_session),
            counterparty: counterparty.clone(),
            protocol: protocol.into(),
            role: Role::Responder,
            state: ChannelState::Open,
            init_sent: true,
            next_send_seq: 0,
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            unconfirmed: Vec::new(),
        };
        if let Some(payload) = first_payload {
            channel.ready.push_back(Delivery::Data(payload));
            channel.next_recv_seq = 1;
        }
        let confirm = Outbound {
            to: counterparty,
            message: SessionMessage::Confirm {
                initiator_session,
                responder_session: local,
            },
        };
        (channel, confirm)
    }

    /// This end's id.
    pub fn local(&self) -> SessionId {
        self.local
    }

    /// The counterparty's end, once known.
    pub fn peer_session(&self) -> Option<SessionId> {
        self.peer_session
    }

    /// The counterparty.
    pub fn counterparty(&self) -> &PartyName {
        &self.counterparty
    }

    /// Protocol identifier.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Which side opened the session.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Returns true if the channel can still carry traffic in both directions.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ChannelState::Initiating | ChannelState::Open)
    }

    /// Returns true if an in-order item is waiting for the flow.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn ensure_sendable(&self) -> Result<()> {
        match &self.state {
            ChannelState::Initiating | ChannelState::Open => Ok(()),
            ChannelState::Ended { .. } => Err(SessionError::NotOpen("ended by counterparty".into())),
            ChannelState::Rejected { reason } => {
                Err(SessionError::NotOpen(format!("rejected: {}", reason)))
            }
            ChannelState::Closed => Err(SessionError::NotOpen("closed".into())),
        }
    }

    /// Queues a payload, returning the frame to transmit now, if any.
    ///
    /// The first payload of an initiator travels inside the Init; later
    /// payloads sent before Confirm are held until the peer session is known.
    pub fn send(&mut self, payload: Payload) -> Result<Option<Outbound>> {
        self.ensure_sendable()?;
        let seq = self.next_send_seq;
        self.next_send_seq += 1;

        if !self.init_sent {
            self.init_sent = true;
            return Ok(Some(self.init_frame(Some(payload))));
        }
        Ok(self.sequenced(seq, Delivery::Data(payload)))
    }

    /// Returns the Init frame if the session has not been opened on the wire yet.
    pub fn ensure_init(&mut self) -> Option<Outbound> {
        if self.init_sent || self.role == Role::Responder || !self.is_active() {
            return None;
        }
        self.init_sent = true;
        Some(self.init_frame(None))
    }

    fn init_frame(&self, first_payload: Option<Payload>) -> Outbound {
        Outbound {
            to: self.counterparty.clone(),
            message: SessionMessage::Init {
                initiator_session: self.local,
                protocol: self.protocol.clone(),
                first_payload,
            },
        }
    }

    fn sequenced(&mut self, seq: u64, delivery: Delivery) -> Option<Outbound> {
        match self.peer_session {
            Some(recipient_session) => Some(Outbound {
                to: self.counterparty.clone(),
                message: frame(recipient_session, seq, delivery),
            }),
            None => {
                self.unconfirmed.push((seq, delivery));
                None
            }
        }
    }

    /// Handles Confirm, returning frames held back until now.
    pub fn on_confirm(&mut self, responder_session: SessionId) -> Vec<Outbound> {
        if self.role != Role::Initiator || self.peer_session.is_some() {
            return Vec::new();
        }
        self.peer_session = Some(responder_session);
        if self.state == ChannelState::Initiating {
            self.state = ChannelState::Open;
        }
        std::mem::take(&mut self.unconfirmed)
            .into_iter()
            .map(|(seq, delivery)| Outbound {
                to: self.counterparty.clone(),
                message: frame(responder_session, seq, delivery),
            })
            .collect()
    }

    /// Handles Reject.
    pub fn on_reject(&mut self, reason: String) {
        if self.state == ChannelState::Initiating {
            self.unconfirmed.clear();
            self.state = ChannelState::Rejected { reason };
        }
    }

    /// Feeds a sequenced Data or End frame.
    ///
    /// At most [`REORDER_WINDOW`] frames are buffered ahead of a gap.
    pub fn on_wire(&mut self, seq: u64, delivery: Delivery) -> WireOutcome {
        if seq < self.next_recv_seq || self.reorder.contains_key(&seq) {
            return WireOutcome::Duplicate;
        }
        if seq - self.next_recv_seq >= REORDER_WINDOW {
            return WireOutcome::OutOfWindow;
        }
        self.reorder.insert(seq, delivery);
        while let Some(next) = self.reorder.remove(&self.next_recv_seq) {
            self.ready.push_back(next);
            self.next_recv_seq += 1;
        }
        WireOutcome::Accepted
    }

    /// Takes the next in-order payload.
    ///
    /// Returns `Ok(None)` if nothing has arrived yet. Once the counterparty's
    /// End is reached, or the session was rejected or closed, returns the
    /// termination instead.
    pub fn take_next(&mut self) -> std::result::Result<Option<Payload>, SessionTermination> {
        match &self.state {
            ChannelState::Ended { error } => return Err(SessionTermination::Ended(error.clone())),
            ChannelState::Rejected { reason } => {
                return Err(SessionTermination::Rejected(reason.clone()))
            }
            ChannelState::Closed => return Err(SessionTermination::Closed),
            ChannelState::Initiating | ChannelState::Open => {}
        }
        match self.ready.pop_front() {
            Some(Delivery::Data(payload)) => Ok(Some(payload)),
            Some(Delivery::End(error)) => {
                self.state = ChannelState::Ended {
                    error: error.clone(),
                };
                Err(SessionTermination::Ended(error))
            }
            None => Ok(None),
        }
    }

    /// Ends the session from this side, optionally reporting a failure.
    ///
    /// Returns the End frame to transmit now, if the peer session is known.
    pub fn end(&mut self, error: Option<ErrorReport>) -> Option<Outbound> {
        if !self.is_active() {
            return None;
        }
        let outbound = if self.init_sent {
            let seq = self.next_send_seq;
            self.next_send_seq += 1;
            self.sequenced(seq, Delivery::End(error))
        } else {
            None
        };
        self.state = ChannelState::Closed;
        outbound
    }
}

fn frame(recipient_session: SessionId, seq: u64, delivery: Delivery) -> SessionMessage {
    match delivery {
        Delivery::Data(payload) => SessionMessage::Data {
            recipient_session,
            seq,
            payload,
        },
        Delivery::End(error) => SessionMessage::End {
            recipient_session,
            seq,
            error,
        },
    }
}
