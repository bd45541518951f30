//! # Tally Node
//!
//! Assembles a ledger node from the Tally crates: key management and the
//! identity directory, record and checkpoint stores, the uniqueness provider
//! on notary nodes, the protocol library, and the flow engine that runs it all.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                   Tally Node                  │
//! ├───────────────────────────────────────────────┤
//! │  Protocols   swap identities, fetch, notarise │
//! │  Flow engine checkpoints, sessions, restore   │
//! │  Services    keys, identities, records, clock │
//! │  Notary      uniqueness provider (optional)   │
//! │  Storage     memory or RocksDB                │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin tally-node -- --parties "O=Alice" --parties "O=Bob"
//! ```
//!
//! ## Modules
//!
//! - [`config`] - YAML node configuration
//! - [`devnet`] - several nodes on one in-memory network
//! - [`observability`] - logging setup and Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod devnet;
mod error;
mod node;
pub mod observability;

pub use config::{NodeConfig, StorageBackend, StorageConfig};
pub use devnet::Devnet;
pub use error::{NodeError, Result};
pub use node::Node;
