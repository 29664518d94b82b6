//! Flow identifiers and the static weight registry.
//!
//! A flow is identified by the UDP source port of its sender. The registry is built once at
//! startup and never mutated afterwards, so both scheduler tasks can read it without locking.

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Stable flow identifier (the sender's transport-level source port).
pub type FlowId = u16;

/// Derive the flow identifier from a sender's socket address.
pub fn flow_id_of(sender: &SocketAddr) -> FlowId {
    sender.port()
}

/// Static mapping from flow identifier to weight.
///
/// Weights are relative: a flow with weight 4 receives four times the service of a flow with
/// weight 1 while both are backlogged. Iteration order is ascending by flow id so that statistics
/// and logs are stable between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRegistry {
    weights: BTreeMap<FlowId, f64>,
}

impl FlowRegistry {
    /// Build a registry, rejecting empty tables, duplicate ids and non-positive weights.
    pub fn new(entries: impl IntoIterator<Item = (FlowId, f64)>) -> Result<Self, ConfigError> {
        let mut weights = BTreeMap::new();
        for (flow, weight) in entries {
            if !(weight.is_finite() && weight > 0.0) {
                return Err(ConfigError::InvalidWeight { flow, weight });
            }
            if weights.insert(flow, weight).is_some() {
                return Err(ConfigError::DuplicateFlow(flow));
            }
        }
        if weights.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        Ok(Self { weights })
    }

    /// Weight of a registered flow, `None` for unknown traffic.
    pub fn weight(&self, flow: FlowId) -> Option<f64> {
        self.weights.get(&flow).copied()
    }

    pub fn contains(&self, flow: FlowId) -> bool {
        self.weights.contains_key(&flow)
    }

    /// Registered flow ids in ascending order.
    pub fn flows(&self) -> impl Iterator<Item = FlowId> + '_ {
        self.weights.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlowId, f64)> + '_ {
        self.weights.iter().map(|(flow, weight)| (*flow, *weight))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
