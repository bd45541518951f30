//! A local network of nodes sharing one in-memory transport.

use crate::{Node, NodeConfig, Result};
use std::sync::Arc;
use tally_session::{MemoryNetwork, SessionConfig};
use tally_types::PartyName;

/// Nodes connected by a [`MemoryNetwork`], each knowing every other's
/// well-known identity.
#[derive(Debug)]
pub struct Devnet {
    network: MemoryNetwork,
    nodes: Vec<Node>,
}

impl Devnet {
    /// Builds and starts one node per name. `notary` names the node hosting
    /// the uniqueness provider, if any.
    pub fn new(names: &[&str], notary: Option<&str>, session: SessionConfig) -> Result<Self> {
        let configs = names
            .iter()
            .map(|name| NodeConfig {
                notary: notary == Some(*name),
                session: session.clone(),
                ..NodeConfig::for_party(*name)
            })
            .collect();
        Self::from_configs(configs)
    }

    /// Builds and starts one node per configuration.
    pub fn from_configs(configs: Vec<NodeConfig>) -> Result<Self> {
        let network = MemoryNetwork::new();
        let nodes = configs
            .into_iter()
            .map(|config| {
                let transport = network.join(config.party_name()?);
                Node::new(config, Arc::new(transport))
            })
            .collect::<Result<Vec<_>>>()?;

        for node in &nodes {
            for peer in &nodes {
                if peer.name() != node.name() {
                    node.register_peer(peer.identity().clone())?;
                }
            }
        }
        for node in &nodes {
            node.start()?;
        }
        tracing::info!(nodes = nodes.len(), "Devnet running");
        Ok(Self { network, nodes })
    }

    /// The shared network, for fault injection.
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// All nodes, in construction order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The node with the given legal name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name().as_str() == name)
    }

    /// The notary node, if there is one.
    pub fn notary(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.config().notary)
    }

    /// Legal names of every node.
    pub fn names(&self) -> Vec<PartyName> {
        self.nodes.iter().map(|n| n.name().clone()).collect()
    }

    /// Stops every node.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
