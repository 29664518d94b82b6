//! Virtual Time Engine
//!
//! Keeps the scheduler-wide virtual clock and the per-flow finish-time bookkeeping that implements
//! weighted fairness.
//!
//! Algorithm (classical WFQ finish-time recurrence):
//! 1. `base = max(global_vt, last_vft[flow])`
//! 2. `vft = base + 1 / (service_rate * weight[flow])`
//! 3. Remember the old `last_vft` in a single rollback slot, then store `vft`
//!
//! Packets of a flow are therefore spaced in virtual time inversely to its weight, and a flow that
//! went idle restarts from the current global virtual time instead of claiming stale credit.

use crate::error::SchedulerError;
use crate::flow::{FlowId, FlowRegistry};
use std::collections::HashMap;

/// Result of a VFT computation, kept alongside the packet so the assignment can be undone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VftAssignment {
    pub flow_id: FlowId,
    /// Virtual finish time assigned to the packet.
    pub vft: f64,
    /// The flow's `last_vft` immediately before this assignment.
    pub prior_vft: f64,
}

/// Mutable per-flow clock state.
#[derive(Debug, Clone, Copy)]
struct FlowState {
    weight: f64,
    /// VFT most recently assigned to a packet of this flow.
    last_vft: f64,
    /// Value of `last_vft` before the most recent assignment; emptied by a rollback.
    previous_vft: Option<f64>,
}

/// Global virtual time plus per-flow finish times.
#[derive(Debug)]
pub struct VirtualTimeEngine {
    service_rate: f64,
    global_vt: f64,
    flows: HashMap<FlowId, FlowState>,
}

impl VirtualTimeEngine {
    /// Create an engine for every flow in the registry, all clocks at zero.
    ///
    /// # Arguments
    /// * `registry` - Admitted flows and their weights
    /// * `service_rate` - Output capacity in packets per second shared by all flows
    pub fn new(registry: &FlowRegistry, service_rate: f64) -> Self {
        let flows = registry
            .iter()
            .map(|(flow, weight)| {
                (
                    flow,
                    FlowState {
                        weight,
                        last_vft: 0.0,
                        previous_vft: None,
                    },
                )
            })
            .collect();
        Self {
            service_rate,
            global_vt: 0.0,
            flows,
        }
    }

    /// Assign the next virtual finish time for `flow`.
    ///
    /// # Returns
    /// The assignment (new VFT and the clock value it replaced), or
    /// [`SchedulerError::UnknownFlow`] when the flow has no registered weight.
    pub fn compute_vft(&mut self, flow: FlowId) -> Result<VftAssignment, SchedulerError> {
        let global_vt = self.global_vt;
        let service_rate = self.service_rate;
        let state = self
            .flows
            .get_mut(&flow)
            .ok_or(SchedulerError::UnknownFlow(flow))?;

        let base = global_vt.max(state.last_vft);
        let vft = base + 1.0 / (service_rate * state.weight);
        let prior_vft = state.last_vft;

        state.previous_vft = Some(prior_vft);
        state.last_vft = vft;

        Ok(VftAssignment {
            flow_id: flow,
            vft,
            prior_vft,
        })
    }

    /// Undo the clock advance of a dropped packet.
    ///
    /// Only the flow's newest assignment can be undone: if another packet of the same flow has been
    /// assigned after `assignment` and is still outstanding, the flow's clock is left alone and
    /// `false` is returned.
    pub fn rollback(&mut self, assignment: &VftAssignment) -> bool {
        let Some(state) = self.flows.get_mut(&assignment.flow_id) else {
            return false;
        };
        if state.last_vft != assignment.vft {
            return false;
        }
        // The slot holds the same value as `prior_vft` unless an earlier rollback consumed it.
        state.last_vft = state.previous_vft.take().unwrap_or(assignment.prior_vft);
        true
    }

    /// Raise global virtual time to `to`; never lowers it.
    pub fn advance_global_time(&mut self, to: f64) {
        if to > self.global_vt {
            self.global_vt = to;
        }
    }

    pub fn global_time(&self) -> f64 {
        self.global_vt
    }

    pub fn last_vft(&self, flow: FlowId) -> Option<f64> {
        self.flows.get(&flow).map(|state| state.last_vft)
    }

    pub fn previous_vft(&self, flow: FlowId) -> Option<f64> {
        self.flows.get(&flow).and_then(|state| state.previous_vft)
    }

    pub fn weight(&self, flow: FlowId) -> Option<f64> {
        self.flows.get(&flow).map(|state| state.weight)
    }

    pub fn service_rate(&self) -> f64 {
        self.service_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn engine() -> VirtualTimeEngine {
        let registry = FlowRegistry::new([(1, 1.0), (2, 2.0)]).unwrap();
        VirtualTimeEngine::new(&registry, 10.0)
    }

    #[test]
    fn vft_is_inverse_to_weight() {
        let mut engine = engine();
        let a = engine.compute_vft(1).unwrap();
        let b = engine.compute_vft(2).unwrap();
        assert!((a.vft - 0.1).abs() < EPS);
        assert!((b.vft - 0.05).abs() < EPS);
        assert_eq!(a.prior_vft, 0.0);
    }

    #[test]
    fn consecutive_packets_are_spaced_from_last_vft() {
        let mut engine = engine();
        engine.compute_vft(2).unwrap();
        let second = engine.compute_vft(2).unwrap();
        assert!((second.vft - 0.10).abs() < EPS);
        assert!((second.prior_vft - 0.05).abs() < EPS);
        assert_eq!(engine.previous_vft(2), Some(second.prior_vft));
    }

    #[test]
    fn idle_flow_restarts_from_global_time() {
        let mut engine = engine();
        engine.compute_vft(1).unwrap();
        engine.advance_global_time(3.0);
        let next = engine.compute_vft(1).unwrap();
        assert!((next.vft - 3.1).abs() < EPS);
    }

    #[test]
    fn rollback_restores_previous_clock() {
        let mut engine = engine();
        engine.compute_vft(1).unwrap();
        let before = engine.last_vft(1).unwrap();
        let dropped = engine.compute_vft(1).unwrap();

        assert!(engine.rollback(&dropped));
        assert_eq!(engine.last_vft(1), Some(before));
        assert_eq!(engine.previous_vft(1), None);
    }

    #[test]
    fn rollback_of_stale_assignment_is_ignored() {
        let mut engine = engine();
        let older = engine.compute_vft(1).unwrap();
        let newer = engine.compute_vft(1).unwrap();

        assert!(!engine.rollback(&older));
        assert_eq!(engine.last_vft(1), Some(newer.vft));
    }

    #[test]
    fn rollback_after_slot_consumed_uses_recorded_prior() {
        let mut engine = engine();
        let first = engine.compute_vft(1).unwrap();
        let second = engine.compute_vft(1).unwrap();

        assert!(engine.rollback(&second));
        assert!(engine.rollback(&first));
        assert_eq!(engine.last_vft(1), Some(0.0));
    }

    #[test]
    fn global_time_never_decreases() {
        let mut engine = engine();
        engine.advance_global_time(5.0);
        engine.advance_global_time(2.0);
        assert_eq!(engine.global_time(), 5.0);
    }

    #[test]
    fn unknown_flow_is_an_error() {
        let mut engine = engine();
        assert_eq!(engine.compute_vft(99), Err(SchedulerError::UnknownFlow(99)));
    }
}
