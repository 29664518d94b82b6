//! Ingress Task
//!
//! Consumes datagrams from an [`IngressChannel`], classifies them by flow and hands them to the
//! shared [`WfqScheduler`] for VFT assignment and admission.
//!
//! Algorithm:
//! 1. Receive `(payload, sender)` (poll timeout = shutdown check)
//! 2. Derive the flow id from the sender; unknown flows are discarded without touching state
//! 3. Under the scheduler lock: idle catch-up, compute VFT, admit / evict / reject
//! 4. Record the decision in the metrics; drops are never signalled to the sender

use super::{Admission, WfqScheduler};
use crate::channel::IngressChannel;
use crate::flow::flow_id_of;
use crate::metrics::SchedulerMetrics;
use crate::packet::Datagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Producer half of the scheduler.
pub struct IngressTask<I: IngressChannel> {
    channel: I,
    scheduler: Arc<WfqScheduler>,
    metrics: Arc<SchedulerMetrics>,
}

impl<I: IngressChannel> IngressTask<I> {
    pub fn new(channel: I, scheduler: Arc<WfqScheduler>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            channel,
            scheduler,
            metrics,
        }
    }

    /// Receive and classify datagrams until `running` is cleared.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match self.channel.recv() {
                Ok(Some(datagram)) => {
                    self.handle(datagram);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.metrics.record_receive_error();
                    warn!(error = %e, "ingress receive failed");
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        // Channel is gone for good; nothing more will arrive.
                        break;
                    }
                }
            }
        }
        debug!("ingress task stopped");
    }

    /// Classify one datagram and attempt admission.
    ///
    /// Returns the admission decision, or `None` when the sender is not a registered flow.
    pub fn handle(&self, datagram: Datagram) -> Option<Admission> {
        let Datagram { payload, sender } = datagram;
        let flow = flow_id_of(&sender);

        if !self.scheduler.registry().contains(flow) {
            self.metrics.record_unknown_flow();
            debug!(%sender, flow, "discarding datagram from unregistered flow");
            return None;
        }

        let outcome = match self.scheduler.enqueue(flow, payload, sender) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Unreachable while the registry check above holds.
                warn!(error = %e, flow, "enqueue refused");
                return None;
            }
        };
        self.metrics.record_enqueue(flow, &outcome);

        match &outcome.admission {
            Admission::Admitted => {
                trace!(
                    flow,
                    vft = outcome.vft,
                    queue_len = outcome.queue_len,
                    idle = outcome.was_idle,
                    "admitted"
                );
            }
            Admission::Evicted(evicted) => {
                debug!(
                    flow,
                    vft = outcome.vft,
                    evicted_flow = evicted.flow_id(),
                    evicted_vft = evicted.vft(),
                    "admitted after evicting worst packet"
                );
            }
            Admission::Rejected(rejected) => {
                debug!(flow, vft = rejected.vft(), "buffer full, rejected arrival");
            }
        }

        Some(outcome.admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_ingress;
    use crate::clock::ManualClock;
    use crate::flow::FlowRegistry;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn task(buffer: usize) -> (IngressTask<crate::channel::MemoryIngress>, Arc<WfqScheduler>, Arc<SchedulerMetrics>) {
        let registry = FlowRegistry::new([(5001, 1.0), (5002, 2.0)]).unwrap();
        let metrics = Arc::new(SchedulerMetrics::new(&registry));
        let scheduler = Arc::new(WfqScheduler::new(
            registry,
            10.0,
            buffer,
            Arc::new(ManualClock::new(0.0)),
        ));
        let (_tx, ingress) = memory_ingress(Duration::from_millis(1));
        (
            IngressTask::new(ingress, scheduler.clone(), metrics.clone()),
            scheduler,
            metrics,
        )
    }

    fn from(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn unknown_flow_is_discarded_silently() {
        let (task, scheduler, metrics) = task(4);
        assert!(task.handle(Datagram::new(b"x".to_vec(), from(7000))).is_none());
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.global_time(), 0.0);
        assert_eq!(metrics.unknown_flow_drops(), 1);
    }

    #[test]
    fn registered_flow_is_admitted_with_destination() {
        let (task, scheduler, _metrics) = task(4);
        let admission = task.handle(Datagram::new(b"hi".to_vec(), from(5002))).unwrap();
        assert!(matches!(admission, Admission::Admitted));

        let packet = scheduler.dispatch_next().unwrap();
        assert_eq!(packet.destination(), from(5002));
        assert_eq!(packet.payload(), b"hi");
        assert!((packet.vft() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn run_admits_received_datagrams_until_disconnect() {
        let registry = FlowRegistry::new([(5001, 1.0)]).unwrap();
        let metrics = Arc::new(SchedulerMetrics::new(&registry));
        let scheduler = Arc::new(WfqScheduler::new(
            registry,
            10.0,
            4,
            Arc::new(ManualClock::new(0.0)),
        ));
        let (tx, ingress) = memory_ingress(Duration::from_millis(1));
        tx.send(Datagram::new(b"one".to_vec(), from(5001))).unwrap();
        tx.send(Datagram::new(b"two".to_vec(), from(5001))).unwrap();
        drop(tx);

        IngressTask::new(ingress, scheduler.clone(), metrics.clone())
            .run(Arc::new(AtomicBool::new(true)));

        assert_eq!(scheduler.queue_len(), 2);
        assert_eq!(metrics.snapshot(&scheduler).receive_errors, 1);
    }

    #[test]
    fn run_stops_when_flag_is_cleared() {
        let (task, _scheduler, _metrics) = task(4);
        let running = Arc::new(AtomicBool::new(false));
        task.run(running);
    }
}
