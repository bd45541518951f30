//! The flow programming model.
//!
//! A flow is written as an explicit state machine. Each time it needs a
//! message from a counterparty it returns [`Step::Receive`] carrying exactly
//! the local state it needs afterwards; the engine checkpoints that state,
//! transmits anything the flow sent, and calls [`FlowLogic::resume`] once the
//! message arrives, even if the node restarted in between.
//!
//! Code between suspension points must be deterministic with respect to its
//! inputs and state so that replay from a checkpoint produces the same
//! outbound messages.

use crate::{FlowContext, FlowError, FlowResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_session::Payload;
use tally_types::Timestamp;

/// Handle to one of the current flow's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionRef(pub(crate) u32);

impl SessionRef {
    /// Index of the session within its flow.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// What a flow does next.
#[derive(Debug)]
pub enum Step<S, O> {
    /// Suspend until the next message on `session`.
    Receive {
        /// Session to wait on.
        session: SessionRef,
        /// State to resume with.
        state: S,
    },
    /// Suspend until the clock reaches `until`.
    Sleep {
        /// Wake-up instant.
        until: Timestamp,
        /// State to resume with.
        state: S,
    },
    /// Finish with a result.
    Done(O),
}

/// A message delivered to a resumed flow.
#[derive(Debug, Clone)]
pub struct Received {
    /// Session it arrived on.
    pub session: SessionRef,
    /// The payload.
    pub payload: Payload,
}

impl Received {
    /// Decodes the payload, failing the flow if it has an unexpected shape.
    pub fn decode<T: DeserializeOwned>(&self) -> FlowResult<T> {
        self.payload.decode().map_err(|e| {
            FlowError::UnexpectedMessage(format!(
                "expected {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })
    }
}

/// Business logic run by the flow engine.
///
/// The logic value itself holds the flow's arguments and is checkpointed
/// alongside its state.
pub trait FlowLogic: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name. Sessions opened by this flow use it as their protocol identifier.
    const NAME: &'static str;

    /// Local state carried across suspension points.
    type State: Serialize + DeserializeOwned + Send + 'static;

    /// Result delivered to the starter.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Runs until the first suspension point.
    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<Step<Self::State, Self::Output>>;

    /// Continues after a message arrives.
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: Self::State,
        received: Received,
    ) -> FlowResult<Step<Self::State, Self::Output>>;

    /// Continues after a [`Step::Sleep`] elapses.
    fn wake(
        &self,
        _ctx: &mut FlowContext<'_>,
        _state: Self::State,
    ) -> FlowResult<Step<Self::State, Self::Output>> {
        Err(FlowError::UnexpectedMessage(format!(
            "{} does not sleep",
            Self::NAME
        )))
    }
}
