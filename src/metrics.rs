//! Drop, dispatch and pacing counters.
//!
//! Drops are never signalled to senders, so these counters (and the logs built from them) are the
//! only place where admission decisions become observable. Hot-path updates are relaxed atomics;
//! the statistics thread turns them into a serialisable [`MetricsSnapshot`] on its own schedule.

use crate::flow::{FlowId, FlowRegistry};
use crate::scheduler::{Admission, EnqueueOutcome, WfqScheduler};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Per-flow atomic counters.
#[derive(Debug, Default)]
struct FlowCounters {
    received: AtomicU64,
    admitted: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    bytes_dispatched: AtomicU64,
    send_failures: AtomicU64,
}

/// Running mean of a duration series plus its last sample.
#[derive(Debug, Default, Clone, Copy)]
struct DurationStats {
    last: Duration,
    total: Duration,
    count: u64,
}

impl DurationStats {
    fn record(&mut self, sample: Duration) {
        self.last = sample;
        self.total += sample;
        self.count += 1;
    }

    fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total.as_secs_f64() * 1_000.0 / self.count as f64
        }
    }
}

/// Counters shared by the ingress, dispatch and statistics threads.
#[derive(Debug)]
pub struct SchedulerMetrics {
    weights: HashMap<FlowId, f64>,
    flows: HashMap<FlowId, FlowCounters>,
    unknown_flow_drops: AtomicU64,
    receive_errors: AtomicU64,
    queue_high_water: AtomicUsize,
    dispatch_interval: Mutex<DurationStats>,
    queueing_delay: Mutex<DurationStats>,
}

impl SchedulerMetrics {
    /// One counter set per registered flow; the map itself never changes afterwards.
    pub fn new(registry: &FlowRegistry) -> Self {
        Self {
            weights: registry.iter().collect(),
            flows: registry
                .flows()
                .map(|flow| (flow, FlowCounters::default()))
                .collect(),
            unknown_flow_drops: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            queue_high_water: AtomicUsize::new(0),
            dispatch_interval: Mutex::new(DurationStats::default()),
            queueing_delay: Mutex::new(DurationStats::default()),
        }
    }

    pub fn record_unknown_flow(&self) {
        self.unknown_flow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for an admission decision, including the packet it may have evicted.
    pub fn record_enqueue(&self, flow: FlowId, outcome: &EnqueueOutcome) {
        if let Some(counters) = self.flows.get(&flow) {
            counters.received.fetch_add(1, Ordering::Relaxed);
            match &outcome.admission {
                Admission::Admitted => {
                    counters.admitted.fetch_add(1, Ordering::Relaxed);
                }
                Admission::Evicted(evicted) => {
                    counters.admitted.fetch_add(1, Ordering::Relaxed);
                    if let Some(victim) = self.flows.get(&evicted.flow_id()) {
                        victim.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Admission::Rejected(_) => {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.queue_high_water
            .fetch_max(outcome.queue_len, Ordering::Relaxed);
    }

    /// Record a packet handed to the egress channel.
    ///
    /// # Arguments
    /// * `flow` - Flow the packet belonged to
    /// * `bytes` - Payload length
    /// * `queueing_delay` - Time between admission and dispatch
    /// * `interval` - Time since the previous dispatch, `None` for the first packet
    pub fn record_dispatch(
        &self,
        flow: FlowId,
        bytes: usize,
        queueing_delay: Duration,
        interval: Option<Duration>,
    ) {
        if let Some(counters) = self.flows.get(&flow) {
            counters.dispatched.fetch_add(1, Ordering::Relaxed);
            counters
                .bytes_dispatched
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
        self.queueing_delay.lock().record(queueing_delay);
        if let Some(interval) = interval {
            self.dispatch_interval.lock().record(interval);
        }
    }

    pub fn record_send_failure(&self, flow: FlowId) {
        if let Some(counters) = self.flows.get(&flow) {
            counters.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn unknown_flow_drops(&self) -> u64 {
        self.unknown_flow_drops.load(Ordering::Relaxed)
    }

    /// Dispatched packet count for one flow (0 for unknown flows).
    pub fn dispatched(&self, flow: FlowId) -> u64 {
        self.flows
            .get(&flow)
            .map_or(0, |counters| counters.dispatched.load(Ordering::Relaxed))
    }

    /// Capture counters together with the scheduler's current queue and virtual time.
    pub fn snapshot(&self, scheduler: &WfqScheduler) -> MetricsSnapshot {
        let mut flows: Vec<FlowSnapshot> = self
            .flows
            .iter()
            .map(|(flow, counters)| FlowSnapshot {
                flow_id: *flow,
                weight: self.weights.get(flow).copied().unwrap_or_default(),
                received: counters.received.load(Ordering::Relaxed),
                admitted: counters.admitted.load(Ordering::Relaxed),
                evicted: counters.evicted.load(Ordering::Relaxed),
                rejected: counters.rejected.load(Ordering::Relaxed),
                dispatched: counters.dispatched.load(Ordering::Relaxed),
                bytes_dispatched: counters.bytes_dispatched.load(Ordering::Relaxed),
                send_failures: counters.send_failures.load(Ordering::Relaxed),
                share: 0.0,
            })
            .collect();
        flows.sort_by_key(|flow| flow.flow_id);

        let total_dispatched: u64 = flows.iter().map(|flow| flow.dispatched).sum();
        if total_dispatched > 0 {
            for flow in &mut flows {
                flow.share = flow.dispatched as f64 / total_dispatched as f64;
            }
        }

        let interval = *self.dispatch_interval.lock();
        let delay = *self.queueing_delay.lock();

        MetricsSnapshot {
            global_virtual_time: scheduler.global_time(),
            queue_len: scheduler.queue_len(),
            queue_capacity: scheduler.capacity(),
            queue_high_water: self.queue_high_water.load(Ordering::Relaxed),
            unknown_flow_drops: self.unknown_flow_drops.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            last_dispatch_interval_ms: interval.last.as_secs_f64() * 1_000.0,
            mean_dispatch_interval_ms: interval.mean_ms(),
            mean_queueing_delay_ms: delay.mean_ms(),
            flows,
        }
    }
}

/// Point-in-time view of one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow_id: FlowId,
    pub weight: f64,
    pub received: u64,
    pub admitted: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub dispatched: u64,
    pub bytes_dispatched: u64,
    pub send_failures: u64,
    /// Fraction of all dispatched packets that belonged to this flow.
    pub share: f64,
}

impl FlowSnapshot {
    /// Packets dropped by the buffer policy (evicted after admission or rejected outright).
    pub fn dropped(&self) -> u64 {
        self.evicted + self.rejected
    }
}

/// Serialisable scheduler statistics streamed by the metrics server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub global_virtual_time: f64,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub queue_high_water: usize,
    pub unknown_flow_drops: u64,
    pub receive_errors: u64,
    pub last_dispatch_interval_ms: f64,
    pub mean_dispatch_interval_ms: f64,
    pub mean_queueing_delay_ms: f64,
    pub flows: Vec<FlowSnapshot>,
}

impl MetricsSnapshot {
    pub fn total_dropped(&self) -> u64 {
        self.flows.iter().map(FlowSnapshot::dropped).sum()
    }

    pub fn total_dispatched(&self) -> u64 {
        self.flows.iter().map(|flow| flow.dispatched).sum()
    }
}
