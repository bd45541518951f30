//! # Observability
//!
//! - **Structured logging**: pretty or JSON output through `tracing-subscriber`.
//! - **Prometheus metrics**: flow lifecycles, session traffic, notarisations.
//!
//! ```rust,no_run
//! use tally_node::observability::{init_logging, LogFormat, MetricsState};
//!
//! init_logging("info", LogFormat::Pretty);
//! let metrics = MetricsState::new();
//! println!("{}", metrics.encode().unwrap_or_default());
//! ```

mod logging;
mod metrics;

pub use logging::{default_filter, init_logging, LogFormat};
pub use metrics::{FlowLabels, MetricsState, NotarisationLabels, SessionLabels};
