//! Bounded Scheduling Queue
//!
//! Capacity-limited min-priority structure ordered by `(vft, arrival_time, seq)`. When the buffer
//! is full the queue applies drop-tail-by-VFT: it keeps the `capacity` packets with the smallest
//! keys among the current contents plus the new arrival, and rolls back the virtual clock of
//! whichever packet loses.
//!
//! The queue is a `BTreeMap`, which gives logarithmic access to both ends: the dispatch task pops
//! the minimum while the eviction policy inspects and removes the maximum.

use super::virtual_time::VirtualTimeEngine;
use crate::packet::QueuedPacket;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Total order over queued packets.
#[derive(Debug, Clone, Copy)]
struct PacketKey {
    vft: f64,
    arrival_time: f64,
    seq: u64,
}

impl PacketKey {
    fn of(packet: &QueuedPacket) -> Self {
        Self {
            vft: packet.vft(),
            arrival_time: packet.arrival_time(),
            seq: packet.seq(),
        }
    }
}

impl Ord for PacketKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.vft
            .total_cmp(&other.vft)
            .then_with(|| self.arrival_time.total_cmp(&other.arrival_time))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for PacketKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PacketKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PacketKey {}

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// The packet was queued and nothing was dropped.
    Admitted,
    /// The packet was queued after evicting the returned packet (the previous maximum).
    Evicted(QueuedPacket),
    /// The buffer was full and the packet did not beat the current maximum.
    Rejected(QueuedPacket),
}

impl Admission {
    /// Whether the candidate packet ended up in the queue.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }

    /// The packet dropped by this decision, if any.
    pub fn dropped(&self) -> Option<&QueuedPacket> {
        match self {
            Admission::Admitted => None,
            Admission::Evicted(packet) | Admission::Rejected(packet) => Some(packet),
        }
    }
}

/// Min-ordered, capacity-limited packet buffer.
#[derive(Debug)]
pub struct BoundedQueue {
    packets: BTreeMap<PacketKey, QueuedPacket>,
    capacity: usize,
}

impl BoundedQueue {
    /// # Panics
    /// Panics if `capacity` is zero; configuration validation rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity must be positive");
        Self {
            packets: BTreeMap::new(),
            capacity,
        }
    }

    /// Admit `packet`, evicting the current maximum or rejecting the candidate when full.
    ///
    /// Every drop is paired with exactly one rollback on `engine`, so a flow's clock never stays
    /// advanced for a packet that will not be served.
    pub fn try_admit(&mut self, packet: QueuedPacket, engine: &mut VirtualTimeEngine) -> Admission {
        if self.packets.len() < self.capacity {
            self.packets.insert(PacketKey::of(&packet), packet);
            return Admission::Admitted;
        }

        let beats_max = self
            .packets
            .last_key_value()
            .is_some_and(|(max_key, _)| packet.vft() < max_key.vft);

        if beats_max {
            if let Some((_, evicted)) = self.packets.pop_last() {
                engine.rollback(&evicted.assignment());
                self.packets.insert(PacketKey::of(&packet), packet);
                return Admission::Evicted(evicted);
            }
        }

        engine.rollback(&packet.assignment());
        Admission::Rejected(packet)
    }

    /// Remove and return the packet with the smallest key; `None` when empty.
    pub fn pop_min(&mut self) -> Option<QueuedPacket> {
        self.packets.pop_first().map(|(_, packet)| packet)
    }

    pub fn peek_min(&self) -> Option<&QueuedPacket> {
        self.packets.first_key_value().map(|(_, packet)| packet)
    }

    pub fn peek_max(&self) -> Option<&QueuedPacket> {
        self.packets.last_key_value().map(|(_, packet)| packet)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued packets in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedPacket> {
        self.packets.values()
    }
}
