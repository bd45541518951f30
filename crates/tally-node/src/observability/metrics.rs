//! Prometheus metrics collection.
//!
//! Counts flow lifecycles by protocol, session frames by direction and kind,
//! and notarisations by outcome. [`MetricsState`] plugs into the flow engine
//! as its [`FlowObserver`].

use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tally_flow::{Direction, FlowError, FlowObserver};

/// Flow labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabels {
    /// Registered flow name.
    pub protocol: String,
}

/// Session frame labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    /// Sent or received.
    pub direction: String,
    /// Frame kind (init, confirm, reject, data, end).
    pub kind: String,
}

/// Notarisation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NotarisationLabels {
    /// Outcome (signed, conflict, time_window_invalid, ...).
    pub outcome: String,
}

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Flows started, including restored and responder flows.
    pub flows_started_total: Family<FlowLabels, Counter>,
    /// Flows that returned a result.
    pub flows_completed_total: Family<FlowLabels, Counter>,
    /// Flows that failed or were killed.
    pub flows_failed_total: Family<FlowLabels, Counter>,
    /// Session frames crossing the transport.
    pub session_messages_total: Family<SessionLabels, Counter>,
    /// Frames discarded as duplicates.
    pub session_duplicates_total: Counter,
    /// Notarisation requests made from this node.
    pub notarisations_total: Family<NotarisationLabels, Counter>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Creates a state with every metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let flows_started_total = Family::<FlowLabels, Counter>::default();
        registry.register(
            "tally_flows_started",
            "Flows started on this node",
            flows_started_total.clone(),
        );

        let flows_completed_total = Family::<FlowLabels, Counter>::default();
        registry.register(
            "tally_flows_completed",
            "Flows that completed successfully",
            flows_completed_total.clone(),
        );

        let flows_failed_total = Family::<FlowLabels, Counter>::default();
        registry.register(
            "tally_flows_failed",
            "Flows that failed",
            flows_failed_total.clone(),
        );

        let session_messages_total = Family::<SessionLabels, Counter>::default();
        registry.register(
            "tally_session_messages",
            "Session frames by direction and kind",
            session_messages_total.clone(),
        );

        let session_duplicates_total = Counter::default();
        registry.register(
            "tally_session_duplicates",
            "Session frames discarded as duplicates",
            session_duplicates_total.clone(),
        );

        let notarisations_total = Family::<NotarisationLabels, Counter>::default();
        registry.register(
            "tally_notarisations",
            "Notarisation requests by outcome",
            notarisations_total.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            flows_started_total,
            flows_completed_total,
            flows_failed_total,
            session_messages_total,
            session_duplicates_total,
            notarisations_total,
        }
    }

    /// Records the outcome of a notarisation.
    pub fn record_notarisation(&self, outcome: &str) {
        self.notarisations_total
            .get_or_create(&NotarisationLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }

    fn flow(protocol: &str) -> FlowLabels {
        FlowLabels {
            protocol: protocol.to_string(),
        }
    }
}

impl FlowObserver for MetricsState {
    fn flow_started(&self, name: &str) {
        self.flows_started_total.get_or_create(&Self::flow(name)).inc();
    }

    fn flow_finished(&self, name: &str, error: Option<&FlowError>) {
        let family = match error {
            None => &self.flows_completed_total,
            Some(_) => &self.flows_failed_total,
        };
        family.get_or_create(&Self::flow(name)).inc();
    }

    fn session_message(&self, direction: Direction, kind: &str) {
        self.session_messages_total
            .get_or_create(&SessionLabels {
                direction: direction.as_str().to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    fn duplicate_dropped(&self) {
        self.session_duplicates_total.inc();
    }
}

impl std::fmt::Debug for MetricsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsState").finish_non_exhaustive()
    }
}
