//! # Tally Flow
//!
//! Resumable, checkpointed protocol logic.
//!
//! A flow is a [`FlowLogic`] state machine that talks to flows on other nodes
//! over sessions. The [`FlowEngine`] runs each flow on its own task,
//! checkpoints it at every suspension point and restores it after a restart,
//! so a multi-party protocol survives crashes on either side.
//!
//! Responder flows are created on demand when a counterparty opens a session
//! for a protocol registered in the [`FlowRegistry`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod context;
mod engine;
mod error;
mod handle;
mod logic;
mod registry;
mod services;

pub use context::FlowContext;
pub use engine::{FlowEngine, FINISHED_RETENTION};
pub use error::{FlowError, FlowResult};
pub use handle::{Direction, FlowEvent, FlowHandle, FlowObserver, FlowStatus, NoopObserver};
pub use logic::{FlowLogic, Received, SessionRef, Step};
pub use registry::FlowRegistry;
pub use services::ServiceHub;
