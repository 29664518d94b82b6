//! Dispatch Task
//!
//! Drains the scheduling queue in VFT order at the configured service rate.
//!
//! Algorithm:
//! 1. Under the scheduler lock: pop the minimum-VFT packet and advance global virtual time
//! 2. Release the lock and forward the payload to the packet's destination
//! 3. Pace: coarse sleep for most of `1 / service_rate`, then spin for the last few milliseconds
//! 4. Empty queue: nothing to send this tick; back off briefly without holding the lock

use super::WfqScheduler;
use crate::channel::EgressChannel;
use crate::config::{MAX_SPIN_WINDOW_MS, MIN_SERVICE_RATE};
use crate::metrics::SchedulerMetrics;
use crate::packet::QueuedPacket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Hybrid sleep/spin pacer for a fixed packet rate.
///
/// Sleeps until `spin_window` before the deadline and busy-polls a monotonic clock for the
/// remainder. The spin phase never exceeds `MAX_SPIN_WINDOW_MS` or the interval itself.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    interval: Duration,
    spin_window: Duration,
}

impl Pacer {
    /// # Arguments
    /// * `service_rate` - Packets per second; rates below `MIN_SERVICE_RATE` pace as that minimum
    /// * `spin_window` - Tail of each interval spent spinning; clamped to the spin cap
    pub fn new(service_rate: f64, spin_window: Duration) -> Self {
        let longest = Duration::from_secs_f64(1.0 / MIN_SERVICE_RATE);
        let interval = Duration::try_from_secs_f64(1.0 / service_rate)
            .map_or(longest, |interval| interval.min(longest));
        let spin_window = spin_window
            .min(Duration::from_millis(MAX_SPIN_WINDOW_MS))
            .min(interval);
        Self {
            interval,
            spin_window,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn spin_window(&self) -> Duration {
        self.spin_window
    }

    /// Block until `deadline`, sleeping first and spinning for the final `spin_window`.
    pub fn wait_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline <= now {
            return;
        }
        let remaining = deadline - now;
        if remaining > self.spin_window {
            std::thread::sleep(remaining - self.spin_window);
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    /// Wait for one interval measured from `start` and return the deadline that was honoured.
    pub fn pace_from(&self, start: Instant) -> Instant {
        let deadline = start + self.interval;
        self.wait_until(deadline);
        deadline
    }
}

/// Consumer half of the scheduler.
pub struct DispatchTask<E: EgressChannel> {
    channel: E,
    scheduler: Arc<WfqScheduler>,
    metrics: Arc<SchedulerMetrics>,
    pacer: Pacer,
    idle_backoff: Duration,
    last_dispatch: Option<Instant>,
}

impl<E: EgressChannel> DispatchTask<E> {
    /// # Arguments
    /// * `channel` - Egress transport, owned exclusively by this task
    /// * `scheduler` - Shared scheduler state
    /// * `metrics` - Counters updated per dispatched packet
    /// * `pacer` - Output rate enforcement
    /// * `idle_poll` - Back-off used when the queue is empty (never longer than one interval)
    pub fn new(
        channel: E,
        scheduler: Arc<WfqScheduler>,
        metrics: Arc<SchedulerMetrics>,
        pacer: Pacer,
        idle_poll: Duration,
    ) -> Self {
        let idle_backoff = idle_poll.min(pacer.interval());
        Self {
            channel,
            scheduler,
            metrics,
            pacer,
            idle_backoff,
            last_dispatch: None,
        }
    }

    /// Serve packets until `running` is cleared.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            let tick = Instant::now();
            if self.dispatch_once().is_some() {
                self.pacer.pace_from(tick);
            } else {
                std::thread::sleep(self.idle_backoff);
            }
        }
        debug!("dispatch task stopped");
    }

    /// Pop and forward a single packet without pacing.
    ///
    /// # Returns
    /// The packet that was sent (or whose send failed), `None` when the queue was empty.
    pub fn dispatch_once(&mut self) -> Option<QueuedPacket> {
        // The scheduler lock is released before any I/O happens.
        let packet = self.scheduler.dispatch_next()?;

        let now = Instant::now();
        let interval = self.last_dispatch.map(|previous| now - previous);
        self.last_dispatch = Some(now);

        match self.channel.send(packet.payload(), packet.destination()) {
            Ok(()) => {
                self.metrics.record_dispatch(
                    packet.flow_id(),
                    packet.len(),
                    now.saturating_duration_since(packet.received_at()),
                    interval,
                );
                trace!(
                    flow = packet.flow_id(),
                    vft = packet.vft(),
                    destination = %packet.destination(),
                    interval_ms = interval.map(|i| i.as_secs_f64() * 1_000.0),
                    "dispatched"
                );
            }
            Err(e) => {
                self.metrics.record_send_failure(packet.flow_id());
                warn!(
                    error = %e,
                    flow = packet.flow_id(),
                    destination = %packet.destination(),
                    "egress send failed"
                );
            }
        }

        Some(packet)
    }
}
