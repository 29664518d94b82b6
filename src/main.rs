// WFQ server binary: binds the UDP socket, runs the ingress and dispatch threads, and optionally
// serves JSON metrics until Ctrl+C is received.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wfq_scheduler::config::FlowConfig;
use wfq_scheduler::{Pipeline, WfqConfig};

/// Weighted Fair Queuing UDP echo scheduler.
#[derive(Parser, Debug)]
#[command(name = "wfq-server", version, about)]
struct Cli {
    /// TOML configuration file; command-line flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP address to listen on.
    #[arg(long)]
    bind: Option<String>,

    /// Output rate in packets per second.
    #[arg(long)]
    service_rate: Option<f64>,

    /// Maximum number of queued packets.
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Registered flow as PORT=WEIGHT; repeat for several flows. Replaces the configured registry.
    #[arg(long = "flow", value_name = "PORT=WEIGHT")]
    flows: Vec<FlowConfig>,

    /// TCP address streaming JSON metrics snapshots.
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<WfqConfig> {
        let mut config = match &self.config {
            Some(path) => WfqConfig::from_file(path)?,
            None => WfqConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(rate) = self.service_rate {
            config.service_rate = rate;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if !self.flows.is_empty() {
            config.flows = self.flows;
        }
        if self.metrics_bind.is_some() {
            config.metrics_bind = self.metrics_bind;
        }
        config.validate().context("invalid scheduler configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_thread_names(true)
        .init();

    let config = cli.into_config()?;
    let metrics_addr = config.metrics_addr()?;
    let pipeline = Arc::new(Pipeline::bind_udp(config).context("failed to start scheduler")?);
    if let Some(local) = pipeline.local_addr() {
        tracing::info!(%local, "listening for datagrams");
    }

    // Metrics get their own single-worker runtime; packet threads stay plain OS threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("WFQ-Metrics")
        .enable_all()
        .build()?;
    if let Some(addr) = metrics_addr {
        runtime
            .block_on(pipeline.start_metrics_server(addr))
            .context("failed to start metrics server")?;
    }

    let pipeline_for_signal = pipeline.clone();
    ctrlc::set_handler(move || {
        tracing::info!("shutdown requested");
        pipeline_for_signal.shutdown();
    })?;

    pipeline.run()?;
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    Ok(())
}
