//! Observing flows: status, results, events.

use crate::{FlowError, FlowResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use tally_types::{FlowId, PartyName};
use tokio::sync::watch;

/// Lifecycle of a flow instance.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStatus {
    /// Executing logic or transmitting.
    Running,
    /// Checkpointed and waiting for a message or the clock.
    Suspended,
    /// Finished; holds the JSON-encoded output.
    Completed(Value),
    /// Failed.
    Failed(FlowError),
}

impl FlowStatus {
    /// Returns true once the flow can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed(_) | FlowStatus::Failed(_))
    }
}

/// Typed access to a flow's eventual result.
#[derive(Debug)]
pub struct FlowHandle<T> {
    flow_id: FlowId,
    status: watch::Receiver<FlowStatus>,
    _output: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FlowHandle<T> {
    pub(crate) fn new(flow_id: FlowId, status: watch::Receiver<FlowStatus>) -> Self {
        Self {
            flow_id,
            status,
            _output: PhantomData,
        }
    }

    /// The flow id.
    pub fn id(&self) -> FlowId {
        self.flow_id
    }

    /// Current status.
    pub fn status(&self) -> FlowStatus {
        self.status.borrow().clone()
    }

    /// Waits for the flow to finish and decodes its output.
    pub async fn result(mut self) -> FlowResult<T> {
        loop {
            if let Some(result) = Self::terminal(&self.status.borrow_and_update()) {
                return result;
            }
            if self.status.changed().await.is_err() {
                return Self::terminal(&self.status.borrow()).unwrap_or(Err(FlowError::EngineStopped));
            }
        }
    }

    fn terminal(status: &FlowStatus) -> Option<FlowResult<T>> {
        match status {
            FlowStatus::Completed(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| FlowError::Serialization(e.to_string())),
            ),
            FlowStatus::Failed(error) => Some(Err(error.clone())),
            FlowStatus::Running | FlowStatus::Suspended => None,
        }
    }
}

/// Engine-wide notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// A flow was started locally, by a counterparty, or restored from a checkpoint.
    Started {
        /// Flow id.
        flow_id: FlowId,
        /// Flow name.
        name: String,
        /// The counterparty whose Init created the flow, for responders.
        initiated_by: Option<PartyName>,
    },
    /// A flow finished successfully.
    Completed {
        /// Flow id.
        flow_id: FlowId,
        /// Flow name.
        name: String,
    },
    /// A flow failed.
    Failed {
        /// Flow id.
        flow_id: FlowId,
        /// Flow name.
        name: String,
        /// The failure.
        error: FlowError,
    },
}

/// Direction of a session frame relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Handed to the transport.
    Sent,
    /// Taken from the transport.
    Received,
}

impl Direction {
    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Hook for instrumentation. All methods default to no-ops.
pub trait FlowObserver: Send + Sync {
    /// A flow instance began executing.
    fn flow_started(&self, _name: &str) {}

    /// A flow instance finished.
    fn flow_finished(&self, _name: &str, _error: Option<&FlowError>) {}

    /// A session frame crossed the transport.
    fn session_message(&self, _direction: Direction, _kind: &str) {}

    /// A duplicate frame was discarded.
    fn duplicate_dropped(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl FlowObserver for NoopObserver {}
