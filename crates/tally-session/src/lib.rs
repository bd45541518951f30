//! Session channels for Tally.
//!
//! A session is a logical, bidirectional conversation between one flow on
//! each of two nodes. This crate provides:
//!
//! - the wire messages of the session handshake and data exchange
//!   ([`SessionMessage`]);
//! - [`SessionChannel`], a pure state machine that turns an at-least-once,
//!   duplicating transport into ordered, exactly-once delivery using
//!   per-direction sequence numbers;
//! - the [`Transport`] seam and an in-memory network used by local devnets
//!   and tests;
//! - the retry policy applied to transport failures.
//!
//! A conversation runs:
//!
//! ```text
//! initiator                          responder
//!     | -- Init(protocol, payload?) --> |   responder flow created
//!     | <-------- Confirm ------------- |
//!     | <------- Data(seq) ------------ |
//!     | -------- Data(seq) ----------> |
//!     | -------- End(seq, error?) ---> |
//! ```

mod channel;
mod error;
mod message;
mod retry;
mod transport;

pub use channel::{ChannelState, Delivery, Outbound, Role, SessionChannel, SessionTermination, WireOutcome, REORDER_WINDOW};
pub use error::{Result, SessionError};
pub use message::{ErrorReport, Payload, SessionId, SessionMessage};
pub use retry::{RetryPolicy, SessionConfig};
pub use transport::{MemoryNetwork, MemoryTransport, Transport};
