//! Datagram and queued-packet representations shared by the ingress and dispatch tasks.

use crate::flow::FlowId;
use crate::scheduler::VftAssignment;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static PACKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Raw record delivered by an ingress channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub sender: SocketAddr,
}

impl Datagram {
    pub fn new(payload: impl Into<Vec<u8>>, sender: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            sender,
        }
    }
}

/// Admitted (or candidate) packet waiting in the scheduling queue.
///
/// A [`QueuedPacket`] is built once the virtual finish time is known and never changes afterwards.
/// Ordering inside the queue uses `(vft, arrival_time, seq)`: the sequence number is taken from a
/// process-wide counter at construction, which happens under the scheduler lock, so it reflects
/// insertion order.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    seq: u64,
    flow_id: FlowId,
    vft: f64,
    prior_vft: f64,
    arrival_time: f64,
    received_at: Instant,
    payload: Vec<u8>,
    destination: SocketAddr,
}

impl QueuedPacket {
    /// Wrap a payload with the VFT assignment computed for it.
    pub fn new(
        assignment: VftAssignment,
        arrival_time: f64,
        payload: Vec<u8>,
        destination: SocketAddr,
    ) -> Self {
        Self {
            seq: PACKET_SEQ.fetch_add(1, Ordering::Relaxed),
            flow_id: assignment.flow_id,
            vft: assignment.vft,
            prior_vft: assignment.prior_vft,
            arrival_time,
            received_at: Instant::now(),
            payload,
            destination,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    /// Virtual finish time, the primary dispatch key.
    pub fn vft(&self) -> f64 {
        self.vft
    }

    /// The flow's `last_vft` immediately before this packet was assigned.
    pub fn prior_vft(&self) -> f64 {
        self.prior_vft
    }

    pub fn arrival_time(&self) -> f64 {
        self.arrival_time
    }

    /// Monotonic instant the packet was built, used for queueing delay metrics.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// The VFT assignment this packet carries, used to roll it back when dropped.
    pub fn assignment(&self) -> VftAssignment {
        VftAssignment {
            flow_id: self.flow_id,
            vft: self.vft,
            prior_vft: self.prior_vft,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
