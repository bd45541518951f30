//! Node error types.

use tally_flow::FlowError;
use tally_identity::IdentityError;
use tally_storage::StorageError;
use thiserror::Error;

/// Errors raised while assembling or operating a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A flow failed or could not be started.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// A store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Key or certificate handling failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Metrics could not be encoded.
    #[error("metrics encoding failed")]
    Metrics(#[from] std::fmt::Error),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
