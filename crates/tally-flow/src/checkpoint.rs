//! The serialized continuation of a flow.

use crate::context::SessionTable;
use crate::{FlowError, FlowResult, SessionRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_session::Outbound;
use tally_types::{FlowId, PartyName, Timestamp};

/// Where a flow will continue from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Awaiting {
    /// Not started yet; replaying runs `start` again.
    Start,
    /// Waiting for the next message on a session.
    Receive { session: SessionRef, state: Value },
    /// Waiting for the clock.
    Sleep { until: Timestamp, state: Value },
}

/// Everything needed to rebuild a suspended flow.
///
/// `pending` holds frames queued since the previous checkpoint. They are
/// transmitted after this checkpoint is durable and re-transmitted on
/// restore; receivers discard the copies by sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Checkpoint {
    pub(crate) flow_id: FlowId,
    pub(crate) flow_name: String,
    pub(crate) logic: Value,
    pub(crate) initiated_by: Option<PartyName>,
    pub(crate) initiating: Option<SessionRef>,
    pub(crate) awaiting: Awaiting,
    pub(crate) sessions: SessionTable,
    pub(crate) pending: Vec<Outbound>,
}

impl Checkpoint {
    pub(crate) fn new(flow_id: FlowId, flow_name: &str, logic: Value) -> Self {
        Self {
            flow_id,
            flow_name: flow_name.to_string(),
            logic,
            initiated_by: None,
            initiating: None,
            awaiting: Awaiting::Start,
            sessions: SessionTable::default(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn encode(&self) -> FlowResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> FlowResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FlowError::Serialization(format!("corrupt checkpoint: {}", e)))
    }
}
