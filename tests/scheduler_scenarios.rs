// Behavioural tests for the scheduler core: VFT recurrence, drop-tail-by-VFT with rollback,
// idle catch-up and weighted fairness. Everything here runs single-threaded on a manual clock.

use std::net::SocketAddr;
use std::sync::Arc;

use wfq_scheduler::clock::ManualClock;
use wfq_scheduler::packet::QueuedPacket;
use wfq_scheduler::scheduler::{Admission, BoundedQueue, VirtualTimeEngine};
use wfq_scheduler::{FlowRegistry, WfqScheduler};

const EPS: f64 = 1e-9;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Deterministic pseudo-random source so the property tests are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[test]
fn two_flows_arriving_together_are_ordered_by_weight() {
    let registry = FlowRegistry::new([(1, 1.0), (2, 2.0)]).unwrap();
    let scheduler = WfqScheduler::new(registry, 10.0, 16, Arc::new(ManualClock::new(0.0)));

    let a = scheduler.enqueue(1, b"A".to_vec(), addr(1)).unwrap();
    let b = scheduler.enqueue(2, b"B".to_vec(), addr(2)).unwrap();
    assert!((a.vft - 0.1).abs() < EPS);
    assert!((b.vft - 0.05).abs() < EPS);

    assert_eq!(scheduler.dispatch_next().unwrap().flow_id(), 2);
    assert_eq!(scheduler.dispatch_next().unwrap().flow_id(), 1);
}

#[test]
fn full_buffer_evicts_worse_packet_and_rolls_back_its_flow() {
    // Service rate 1: flow 1 (weight 0.2) gets VFT 5.0, flow 2 (weight 1/3) gets VFT 3.0.
    let registry = FlowRegistry::new([(1, 0.2), (2, 1.0 / 3.0)]).unwrap();
    let mut engine = VirtualTimeEngine::new(&registry, 1.0);
    let mut queue = BoundedQueue::new(1);

    let queued = engine.compute_vft(1).unwrap();
    assert!((queued.vft - 5.0).abs() < EPS);
    assert!(queue
        .try_admit(QueuedPacket::new(queued, 0.0, vec![1], addr(1)), &mut engine)
        .is_admitted());

    let arriving = engine.compute_vft(2).unwrap();
    assert!((arriving.vft - 3.0).abs() < EPS);
    let outcome = queue.try_admit(QueuedPacket::new(arriving, 1.0, vec![2], addr(2)), &mut engine);

    match outcome {
        Admission::Evicted(evicted) => {
            assert_eq!(evicted.flow_id(), 1);
            assert!((evicted.vft() - 5.0).abs() < EPS);
        }
        other => panic!("expected eviction, got {other:?}"),
    }
    assert_eq!(engine.last_vft(1), Some(0.0));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.peek_min().unwrap().flow_id(), 2);
}

#[test]
fn full_buffer_rejects_worse_arrival_and_rolls_it_back() {
    // Service rate 1: flow 1 (weight 0.5) gets VFT 2.0, flow 2 (weight 0.25) gets VFT 4.0.
    let registry = FlowRegistry::new([(1, 0.5), (2, 0.25)]).unwrap();
    let mut engine = VirtualTimeEngine::new(&registry, 1.0);
    let mut queue = BoundedQueue::new(1);

    let queued = engine.compute_vft(1).unwrap();
    queue.try_admit(QueuedPacket::new(queued, 0.0, vec![1], addr(1)), &mut engine);

    let arriving = engine.compute_vft(2).unwrap();
    assert!((arriving.vft - 4.0).abs() < EPS);
    let outcome = queue.try_admit(QueuedPacket::new(arriving, 1.0, vec![2], addr(2)), &mut engine);

    assert!(matches!(outcome, Admission::Rejected(ref p) if p.flow_id() == 2));
    assert_eq!(engine.last_vft(2), Some(0.0));
    assert_eq!(engine.last_vft(1), Some(queued.vft));
    assert_eq!(queue.len(), 1);
    assert!((queue.peek_min().unwrap().vft() - 2.0).abs() < EPS);
}

#[test]
fn idle_queue_catches_virtual_time_up_to_real_time() {
    let clock = Arc::new(ManualClock::new(0.0));
    let registry = FlowRegistry::new([(1, 1.0)]).unwrap();
    let scheduler = WfqScheduler::new(registry, 10.0, 4, clock.clone());

    scheduler.enqueue(1, vec![], addr(1)).unwrap();
    scheduler.dispatch_next().unwrap();
    assert_eq!(scheduler.queue_len(), 0);
    assert!((scheduler.global_time() - 0.1).abs() < EPS);

    clock.set(42.0);
    let outcome = scheduler.enqueue(1, vec![], addr(1)).unwrap();
    assert!(outcome.was_idle);
    assert_eq!(scheduler.global_time(), 42.0);
    assert!((outcome.vft - 42.1).abs() < EPS);
}

#[test]
fn vft_recurrence_capacity_and_rollback_hold_under_random_load() {
    let weights = [(1u16, 1.0), (2, 2.0), (3, 4.0)];
    let rate = 20.0;
    let capacity = 8;
    let clock = Arc::new(ManualClock::new(0.0));
    let registry = FlowRegistry::new(weights).unwrap();
    let scheduler = WfqScheduler::new(registry, rate, capacity, clock.clone());
    let mut rng = Lcg(7);
    let mut last_dispatched = f64::NEG_INFINITY;

    for _ in 0..5_000 {
        clock.advance(0.001 * rng.below(20) as f64);

        if rng.below(3) == 0 {
            if let Some(packet) = scheduler.dispatch_next() {
                assert!(packet.vft() >= last_dispatched, "dispatch order regressed");
                last_dispatched = packet.vft();
            }
            continue;
        }

        let (flow, weight) = weights[rng.below(3) as usize];
        let was_empty = scheduler.queue_len() == 0;
        let gvt_before = scheduler.global_time();
        let last_before = scheduler.last_vft(flow).unwrap();
        let queued_before = scheduler.queued_vfts();

        let outcome = scheduler.enqueue(flow, vec![], addr(flow)).unwrap();

        let gvt_at_assignment = if was_empty {
            gvt_before.max(outcome.arrival_time)
        } else {
            gvt_before
        };
        let expected = gvt_at_assignment.max(last_before) + 1.0 / (rate * weight);
        assert!((outcome.vft - expected).abs() < EPS, "VFT recurrence violated");
        assert!(scheduler.queue_len() <= capacity);

        match &outcome.admission {
            Admission::Admitted => {
                assert_eq!(scheduler.last_vft(flow), Some(outcome.vft));
            }
            Admission::Rejected(_) => {
                assert_eq!(scheduler.last_vft(flow), Some(last_before));
                assert_eq!(scheduler.queued_vfts(), queued_before);
            }
            Admission::Evicted(evicted) => {
                // The victim was the largest key among buffer plus candidate.
                let max_before = queued_before.iter().copied().fold(f64::MIN, f64::max);
                assert_eq!(evicted.vft(), max_before);
                assert!(outcome.vft < evicted.vft());
                if evicted.flow_id() != flow {
                    assert_eq!(scheduler.last_vft(evicted.flow_id()), Some(evicted.prior_vft()));
                }
                // Buffer now holds the `capacity` smallest keys of buffer + candidate.
                let mut expected_keys = queued_before.clone();
                expected_keys.push(outcome.vft);
                expected_keys.sort_by(f64::total_cmp);
                expected_keys.truncate(capacity);
                assert_eq!(scheduler.queued_vfts(), expected_keys);
            }
        }
    }
}

#[test]
fn sustained_load_shares_service_in_proportion_to_weight() {
    let registry = FlowRegistry::new([(1, 1.0), (2, 3.0)]).unwrap();
    let scheduler = WfqScheduler::new(registry, 100.0, 50, Arc::new(ManualClock::new(0.0)));
    let mut dispatched = [0u64; 2];

    for step in 0..6_000 {
        // Both flows offer twice the service rate, so the buffer stays full.
        for _ in 0..2 {
            scheduler.enqueue(1, vec![], addr(1)).unwrap();
            scheduler.enqueue(2, vec![], addr(2)).unwrap();
        }
        let packet = scheduler.dispatch_next().expect("buffer is never empty");
        if step >= 1_000 {
            dispatched[(packet.flow_id() - 1) as usize] += 1;
        }
    }

    let ratio = dispatched[1] as f64 / dispatched[0] as f64;
    assert!(
        (2.9..=3.1).contains(&ratio),
        "expected a 3:1 share, observed {ratio:.3} ({dispatched:?})"
    );
}
