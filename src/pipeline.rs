//! Pipeline orchestration.
//!
//! This module wires the ingress task, the dispatch task and the statistics publisher around one
//! shared [`WfqScheduler`], owns the shutdown flag, and optionally streams metrics snapshots to TCP
//! clients as newline-delimited JSON.

use crate::channel::{bind_udp, EgressChannel, IngressChannel};
use crate::clock::{Clock, MonotonicClock};
use crate::config::WfqConfig;
use crate::error::PipelineError;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::scheduler::{DispatchTask, IngressTask, Pacer, WfqScheduler};
use crate::threading::{set_thread_priority, ThreadPriority};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Snapshots buffered between the statistics thread and the metrics server.
const METRICS_BACKLOG: usize = 64;

/// Shutdown polling granularity for the statistics thread.
const STATS_POLL: Duration = Duration::from_millis(50);

type Channels = (Box<dyn IngressChannel>, Box<dyn EgressChannel>);

/// Complete scheduler wiring: shared state, transport halves, metrics and lifecycle flag.
pub struct Pipeline {
    config: WfqConfig,
    scheduler: Arc<WfqScheduler>,
    metrics: Arc<SchedulerMetrics>,
    /// Cleared by [`Pipeline::shutdown`]; every thread and server task polls it.
    running: Arc<AtomicBool>,
    started: AtomicBool,
    channels: Mutex<Option<Channels>>,
    local_addr: Option<SocketAddr>,
    snapshot_tx: Sender<MetricsSnapshot>,
    snapshot_rx: Receiver<MetricsSnapshot>,
}

impl Pipeline {
    /// Validate `config` and build the scheduler around the supplied transport.
    ///
    /// No thread is started until [`Pipeline::run`].
    pub fn new(
        config: WfqConfig,
        ingress: impl IngressChannel + 'static,
        egress: impl EgressChannel + 'static,
    ) -> Result<Self, PipelineError> {
        Self::with_clock(config, ingress, egress, Arc::new(MonotonicClock::new()))
    }

    /// Same as [`Pipeline::new`] with an explicit real-time source.
    pub fn with_clock(
        config: WfqConfig,
        ingress: impl IngressChannel + 'static,
        egress: impl EgressChannel + 'static,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let registry = config.registry()?;
        let metrics = Arc::new(SchedulerMetrics::new(&registry));
        let scheduler = Arc::new(WfqScheduler::new(
            registry,
            config.service_rate,
            config.buffer_size,
            clock,
        ));
        let (snapshot_tx, snapshot_rx) = crossbeam_channel::bounded(METRICS_BACKLOG);

        Ok(Self {
            config,
            scheduler,
            metrics,
            running: Arc::new(AtomicBool::new(true)),
            started: AtomicBool::new(false),
            channels: Mutex::new(Some((Box::new(ingress), Box::new(egress)))),
            local_addr: None,
            snapshot_tx,
            snapshot_rx,
        })
    }

    /// Bind the configured UDP address and build a pipeline that echoes packets to their senders.
    pub fn bind_udp(config: WfqConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let (ingress, egress) = bind_udp(config.bind_addr()?, config.recv_poll())?;
        let local_addr = ingress.local_addr()?;
        let mut pipeline = Self::new(config, ingress, egress)?;
        pipeline.local_addr = Some(local_addr);
        Ok(pipeline)
    }

    /// Address actually bound by [`Pipeline::bind_udp`] (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &WfqConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<WfqScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.scheduler)
    }

    /// `true` between [`Pipeline::run`] starting its threads and [`Pipeline::shutdown`].
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Relaxed) && self.running.load(Ordering::Relaxed)
    }

    /// Spawn the ingress, dispatch and statistics threads and block until [`Pipeline::shutdown`].
    ///
    /// A pipeline runs at most once; the transport halves move into their threads. Calling
    /// [`Pipeline::shutdown`] before `run` makes every thread exit immediately.
    pub fn run(&self) -> Result<(), PipelineError> {
        let (ingress, egress) = self
            .channels
            .lock()
            .take()
            .ok_or(PipelineError::AlreadyRunning)?;
        self.started.store(true, Ordering::Relaxed);

        info!(
            service_rate = self.config.service_rate,
            buffer_size = self.config.buffer_size,
            flows = ?self.scheduler.registry().iter().collect::<Vec<_>>(),
            "WFQ scheduler started"
        );

        // Each worker reports its exit (including unwinding) so `run` can stop the other one.
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<&'static str>(2);

        let ingress_task = IngressTask::new(ingress, self.scheduler.clone(), self.metrics.clone());
        let running_ingress = self.running.clone();
        let ingress_exit = ExitSignal::new("ingress", exit_tx.clone());
        let ingress_handle = std::thread::Builder::new()
            .name("WFQ-Ingress".to_string())
            .spawn(move || {
                let _exit = ingress_exit;
                set_thread_priority(ThreadPriority::High);
                ingress_task.run(running_ingress);
            })?;

        let dispatch_task = DispatchTask::new(
            egress,
            self.scheduler.clone(),
            self.metrics.clone(),
            Pacer::new(self.config.service_rate, self.config.spin_window()),
            self.config.idle_poll(),
        );
        let running_dispatch = self.running.clone();
        let dispatch_exit = ExitSignal::new("dispatch", exit_tx);
        let dispatch_handle = std::thread::Builder::new()
            .name("WFQ-Dispatch".to_string())
            .spawn(move || {
                let _exit = dispatch_exit;
                set_thread_priority(ThreadPriority::Realtime);
                dispatch_task.run(running_dispatch);
            });
        let dispatch_handle = match dispatch_handle {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Relaxed);
                let _ = ingress_handle.join();
                return Err(e.into());
            }
        };

        let stats_handle = self.spawn_statistics_thread();

        // Either task ending means the pipeline is done; stop the rest.
        if let Ok(first) = exit_rx.recv() {
            debug!(task = first, "pipeline task exited");
        }
        self.running.store(false, Ordering::Relaxed);
        let mut result = join_thread(ingress_handle, "ingress");
        result = result.and(join_thread(dispatch_handle, "dispatch"));
        if let Some(handle) = stats_handle {
            result = result.and(join_thread(handle, "statistics"));
        }

        info!(snapshot = ?self.snapshot(), "WFQ scheduler stopped");
        result
    }

    /// Signal all pipeline threads to stop.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    fn spawn_statistics_thread(&self) -> Option<JoinHandle<()>> {
        let scheduler = self.scheduler.clone();
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let period = self.config.stats_interval();

        let spawned = std::thread::Builder::new()
            .name("WFQ-Statistics".to_string())
            .spawn(move || {
                set_thread_priority(ThreadPriority::Background);
                let mut next_report = Instant::now() + period;
                while running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if now < next_report {
                        std::thread::sleep((next_report - now).min(STATS_POLL));
                        continue;
                    }
                    next_report = now + period;

                    let snapshot = metrics.snapshot(&scheduler);
                    info!(
                        virtual_time = snapshot.global_virtual_time,
                        queue = snapshot.queue_len,
                        dispatched = snapshot.total_dispatched(),
                        dropped = snapshot.total_dropped(),
                        unknown = snapshot.unknown_flow_drops,
                        interval_ms = snapshot.last_dispatch_interval_ms,
                        "scheduler statistics"
                    );
                    for flow in &snapshot.flows {
                        debug!(
                            flow = flow.flow_id,
                            weight = flow.weight,
                            dispatched = flow.dispatched,
                            share = flow.share,
                            evicted = flow.evicted,
                            rejected = flow.rejected,
                            "flow statistics"
                        );
                    }
                    // No metrics server attached means a full backlog; drop silently.
                    let _ = snapshot_tx.try_send(snapshot);
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "statistics thread unavailable");
                None
            }
        }
    }

    /// Start the TCP metrics server.
    ///
    /// Spawns two Tokio tasks: one forwards statistics snapshots as JSON lines into a broadcast
    /// channel, the other accepts clients and streams that broadcast to each connection. Both end
    /// once the pipeline is shut down. The server may be started before [`Pipeline::run`].
    pub async fn start_metrics_server(&self, bind_addr: SocketAddr) -> Result<SocketAddr, PipelineError> {
        use tokio::sync::broadcast;

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        let (tx, _) = broadcast::channel::<String>(METRICS_BACKLOG);

        let snapshot_rx = self.snapshot_rx.clone();
        let running_forward = self.running.clone();
        let forward_tx = tx.clone();
        tokio::task::spawn_blocking(move || loop {
            match snapshot_rx.recv_timeout(STATS_POLL) {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        let _ = forward_tx.send(format!("{json}\n"));
                    }
                    Err(e) => warn!(error = %e, "failed to serialise metrics snapshot"),
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !running_forward.load(Ordering::Relaxed) && snapshot_rx.is_empty() {
                break;
            }
        });

        let running_accept = self.running.clone();
        tokio::spawn(async move {
            let mut shutdown_check = tokio::time::interval(STATS_POLL);
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, peer)) => {
                            debug!(%peer, "metrics client connected");
                            let mut rx = tx.subscribe();
                            tokio::spawn(async move {
                                loop {
                                    let line = match rx.recv().await {
                                        Ok(line) => line,
                                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                            debug!(%peer, skipped, "metrics client lagging");
                                            continue;
                                        }
                                        Err(broadcast::error::RecvError::Closed) => break,
                                    };
                                    if stream.write_all(line.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "metrics accept failed"),
                    },
                    _ = shutdown_check.tick() => {
                        if !running_accept.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }
        });

        info!(%local, "metrics server listening");
        Ok(local)
    }
}

/// Sends the owning task's name when dropped, on normal return and on panic alike.
struct ExitSignal {
    task: &'static str,
    tx: Sender<&'static str>,
}

impl ExitSignal {
    fn new(task: &'static str, tx: Sender<&'static str>) -> Self {
        Self { task, tx }
    }
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.tx.send(self.task);
    }
}

fn join_thread(handle: JoinHandle<()>, name: &'static str) -> Result<(), PipelineError> {
    handle
        .join()
        .map_err(|_| PipelineError::ThreadPanicked(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_egress, memory_ingress};

    #[test]
    fn invalid_config_prevents_construction() {
        let mut config = WfqConfig::default();
        config.service_rate = 0.0;
        let (_tx, ingress) = memory_ingress(Duration::from_millis(1));
        let (egress, _rx) = memory_egress();
        assert!(matches!(
            Pipeline::new(config, ingress, egress),
            Err(PipelineError::Config(_))
        ));
    }

    struct PanickingEgress;

    impl EgressChannel for PanickingEgress {
        fn send(&mut self, _payload: &[u8], _destination: SocketAddr) -> std::io::Result<()> {
            panic!("egress exploded");
        }
    }

    #[test]
    fn dispatch_panic_stops_the_pipeline() {
        let mut config = WfqConfig::default();
        config.pacing.recv_poll_ms = 5;
        let (tx, ingress) = memory_ingress(config.recv_poll());
        let pipeline = Arc::new(Pipeline::new(config, ingress, PanickingEgress).unwrap());

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let runner = {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                let _ = done_tx.send(pipeline.run());
            })
        };
        tx.send(crate::packet::Datagram::new(b"boom".to_vec(), "127.0.0.1:5001".parse().unwrap()))
            .unwrap();

        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("run() must return once the dispatch thread dies");
        assert!(matches!(result, Err(PipelineError::ThreadPanicked("dispatch"))));
        assert!(!pipeline.is_running());
        runner.join().unwrap();
        drop(tx);
    }

    #[test]
    fn pipeline_runs_only_once() {
        let mut config = WfqConfig::default();
        config.stats_interval_ms = 10;
        let (_tx, ingress) = memory_ingress(Duration::from_millis(1));
        let (egress, _rx) = memory_egress();
        let pipeline = Arc::new(Pipeline::new(config, ingress, egress).unwrap());

        let runner = {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || pipeline.run())
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pipeline.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(pipeline.run(), Err(PipelineError::AlreadyRunning)));

        pipeline.shutdown();
        runner.join().unwrap().unwrap();
    }
}
