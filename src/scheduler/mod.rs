//! Weighted Fair Queuing scheduler core.
//!
//! [`WfqScheduler`] owns the bounded queue, the per-flow virtual clocks and the global virtual time
//! behind a single mutex. The ingress and dispatch tasks share it through an `Arc` and each
//! operation runs as one critical section:
//!
//! - enqueue: idle catch-up -> compute VFT -> admit or evict -> rollback of the loser
//! - dispatch: pop minimum -> advance global virtual time
//!
//! Neither task ever blocks on the other except for the short time this lock is held.

pub mod dispatch;
pub mod ingress;
pub mod queue;
pub mod virtual_time;

pub use dispatch::{DispatchTask, Pacer};
pub use ingress::IngressTask;
pub use queue::{Admission, BoundedQueue};
pub use virtual_time::{VftAssignment, VirtualTimeEngine};

use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::flow::{FlowId, FlowRegistry};
use crate::packet::QueuedPacket;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// State guarded by the scheduler lock.
#[derive(Debug)]
struct SchedulerState {
    engine: VirtualTimeEngine,
    queue: BoundedQueue,
}

/// What happened to a packet handed to [`WfqScheduler::enqueue`].
#[derive(Debug)]
pub struct EnqueueOutcome {
    /// VFT computed for the candidate (already rolled back if it was rejected).
    pub vft: f64,
    /// Arrival stamp taken under the lock.
    pub arrival_time: f64,
    /// Whether the queue was empty before this packet, triggering idle catch-up.
    pub was_idle: bool,
    /// Queue depth after the decision.
    pub queue_len: usize,
    pub admission: Admission,
}

/// Shared scheduler object passed to both long-lived tasks.
pub struct WfqScheduler {
    registry: FlowRegistry,
    clock: Arc<dyn Clock>,
    state: Mutex<SchedulerState>,
}

impl WfqScheduler {
    /// Build a scheduler with all virtual clocks at zero and an empty queue.
    ///
    /// # Arguments
    /// * `registry` - Flows admitted at ingress and their weights
    /// * `service_rate` - Packets per second, used in the VFT formula
    /// * `buffer_size` - Maximum number of queued packets (must be positive)
    /// * `clock` - Real-time source used for arrival stamps and idle catch-up
    pub fn new(
        registry: FlowRegistry,
        service_rate: f64,
        buffer_size: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = VirtualTimeEngine::new(&registry, service_rate);
        Self {
            registry,
            clock,
            state: Mutex::new(SchedulerState {
                engine,
                queue: BoundedQueue::new(buffer_size),
            }),
        }
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Compute a VFT for `payload` and try to admit it, all under the scheduler lock.
    ///
    /// If the queue is empty when the packet arrives, global virtual time first catches up to the
    /// current real time so the new VFT is computed from the idle-to-busy transition point.
    pub fn enqueue(
        &self,
        flow: FlowId,
        payload: Vec<u8>,
        destination: SocketAddr,
    ) -> Result<EnqueueOutcome, SchedulerError> {
        if !self.registry.contains(flow) {
            return Err(SchedulerError::UnknownFlow(flow));
        }

        let mut state = self.state.lock();
        let SchedulerState { engine, queue } = &mut *state;

        let now = self.clock.now();
        let was_idle = queue.is_empty();
        if was_idle {
            engine.advance_global_time(now);
        }

        let assignment = engine.compute_vft(flow)?;
        let packet = QueuedPacket::new(assignment, now, payload, destination);
        let admission = queue.try_admit(packet, engine);

        Ok(EnqueueOutcome {
            vft: assignment.vft,
            arrival_time: now,
            was_idle,
            queue_len: queue.len(),
            admission,
        })
    }

    /// Pop the minimum-VFT packet and advance global virtual time to its VFT.
    ///
    /// `None` means there is nothing to send this tick.
    pub fn dispatch_next(&self) -> Option<QueuedPacket> {
        let mut state = self.state.lock();
        let packet = state.queue.pop_min()?;
        state.engine.advance_global_time(packet.vft());
        Some(packet)
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().queue.capacity()
    }

    pub fn global_time(&self) -> f64 {
        self.state.lock().engine.global_time()
    }

    pub fn last_vft(&self, flow: FlowId) -> Option<f64> {
        self.state.lock().engine.last_vft(flow)
    }

    /// VFTs currently queued, in dispatch order.
    pub fn queued_vfts(&self) -> Vec<f64> {
        self.state.lock().queue.iter().map(QueuedPacket::vft).collect()
    }
}

impl std::fmt::Debug for WfqScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WfqScheduler")
            .field("registry", &self.registry)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
