//! Mapping of flow names and protocols to logic.

use crate::{FlowContext, FlowError, FlowLogic, FlowResult, Received, SessionRef, Step};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tally_types::{PartyName, Timestamp};

/// A step with its state and output erased to JSON.
pub(crate) enum ErasedStep {
    Receive { session: SessionRef, state: Value },
    Sleep { until: Timestamp, state: Value },
    Done(Value),
}

fn erase<S: serde::Serialize, O: serde::Serialize>(step: Step<S, O>) -> FlowResult<ErasedStep> {
    Ok(match step {
        Step::Receive { session, state } => ErasedStep::Receive {
            session,
            state: serde_json::to_value(state)?,
        },
        Step::Sleep { until, state } => ErasedStep::Sleep {
            until,
            state: serde_json::to_value(state)?,
        },
        Step::Done(output) => ErasedStep::Done(serde_json::to_value(output)?),
    })
}

/// Object-safe view of a [`FlowLogic`].
pub(crate) trait ErasedFlow: Send + Sync {
    fn name(&self) -> &'static str;
    fn logic(&self) -> FlowResult<Value>;
    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<ErasedStep>;
    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: Value,
        received: Received,
    ) -> FlowResult<ErasedStep>;
    fn wake(&self, ctx: &mut FlowContext<'_>, state: Value) -> FlowResult<ErasedStep>;
}

pub(crate) struct Typed<F>(pub(crate) F);

fn decode_state<S: serde::de::DeserializeOwned>(name: &str, state: Value) -> FlowResult<S> {
    serde_json::from_value(state)
        .map_err(|e| FlowError::Serialization(format!("corrupt state for {}: {}", name, e)))
}

impl<F: FlowLogic> ErasedFlow for Typed<F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    fn logic(&self) -> FlowResult<Value> {
        Ok(serde_json::to_value(&self.0)?)
    }

    fn start(&self, ctx: &mut FlowContext<'_>) -> FlowResult<ErasedStep> {
        erase(self.0.start(ctx)?)
    }

    fn resume(
        &self,
        ctx: &mut FlowContext<'_>,
        state: Value,
        received: Received,
    ) -> FlowResult<ErasedStep> {
        let state = decode_state(F::NAME, state)?;
        erase(self.0.resume(ctx, state, received)?)
    }

    fn wake(&self, ctx: &mut FlowContext<'_>, state: Value) -> FlowResult<ErasedStep> {
        let state = decode_state(F::NAME, state)?;
        erase(self.0.wake(ctx, state)?)
    }
}

type Restorer = Arc<dyn Fn(Value) -> FlowResult<Box<dyn ErasedFlow>> + Send + Sync>;
type ResponderFactory = Arc<dyn Fn(&PartyName) -> Box<dyn ErasedFlow> + Send + Sync>;

fn restorer<F: FlowLogic>() -> Restorer {
    Arc::new(|logic: Value| -> FlowResult<Box<dyn ErasedFlow>> {
        let flow: F = serde_json::from_value(logic)?;
        Ok(Box::new(Typed(flow)) as Box<dyn ErasedFlow>)
    })
}

/// Registered flows.
///
/// Every flow that may be checkpointed must be registered by name so that it
/// can be rebuilt after a restart. Responders are registered against the
/// protocol identifier carried in the session Init.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    restorers: HashMap<&'static str, Restorer>,
    responders: HashMap<String, ResponderFactory>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a flow so that its checkpoints can be restored.
    pub fn register<F: FlowLogic>(&mut self) -> &mut Self {
        self.restorers.entry(F::NAME).or_insert_with(restorer::<F>);
        self
    }

    /// Registers `R` as the responder to sessions opened by initiator `I`.
    pub fn register_responder<I, R>(
        &mut self,
        factory: impl Fn(&PartyName) -> R + Send + Sync + 'static,
    ) -> &mut Self
    where
        I: FlowLogic,
        R: FlowLogic,
    {
        self.register::<I>();
        self.register_responder_for(I::NAME, factory)
    }

    /// Registers `R` as the responder for an explicit protocol identifier.
    ///
    /// Replaces any responder already registered for the protocol.
    pub fn register_responder_for<R: FlowLogic>(
        &mut self,
        protocol: &str,
        factory: impl Fn(&PartyName) -> R + Send + Sync + 'static,
    ) -> &mut Self {
        self.register::<R>();
        self.responders.insert(
            protocol.to_string(),
            Arc::new(move |party: &PartyName| {
                Box::new(Typed(factory(party))) as Box<dyn ErasedFlow>
            }),
        );
        self
    }

    /// Returns true if a responder exists for `protocol`.
    pub fn has_responder(&self, protocol: &str) -> bool {
        self.responders.contains_key(protocol)
    }

    /// Registered protocol identifiers, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<_> = self.responders.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub(crate) fn restore(&self, name: &str, logic: Value) -> FlowResult<Box<dyn ErasedFlow>> {
        let restorer = self
            .restorers
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))?;
        restorer(logic)
    }

    pub(crate) fn responder(&self, protocol: &str, party: &PartyName) -> Option<Box<dyn ErasedFlow>> {
        self.responders.get(protocol).map(|factory| factory(party))
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flows: Vec<_> = self.restorers.keys().collect();
        flows.sort();
        f.debug_struct("FlowRegistry")
            .field("flows", &flows)
            .field("protocols", &self.protocols())
            .finish()
    }
}
