//! Error types shared by configuration loading, the scheduler core, and the pipeline runtime.
//!
//! Drops and empty-queue ticks are not errors: they are reported through
//! [`Admission`](crate::scheduler::Admission) and `Option` respectively. The types here cover the
//! conditions that must stop the scheduler from starting or that indicate a caller bug.

use crate::flow::FlowId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed static configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "service rate must be a finite number of packets per second, at least {min}, got {0}",
        min = crate::config::MIN_SERVICE_RATE
    )]
    InvalidServiceRate(f64),
    #[error("buffer size must be at least one packet")]
    ZeroBufferSize,
    #[error("flow registry is empty; at least one flow must be configured")]
    EmptyRegistry,
    #[error("flow {flow} has invalid weight {weight}; weights must be positive and finite")]
    InvalidWeight { flow: FlowId, weight: f64 },
    #[error("flow {0} is registered more than once")]
    DuplicateFlow(FlowId),
    #[error("invalid flow specification `{0}`, expected PORT=WEIGHT")]
    InvalidFlowSpec(String),
    #[error("spin window of {0} ms exceeds the {max} ms cap", max = crate::config::MAX_SPIN_WINDOW_MS)]
    SpinWindowTooLarge(u64),
    #[error("pacing.{0} must be at least 1 ms")]
    ZeroPollInterval(&'static str),
    #[error("invalid socket address `{0}`")]
    InvalidAddress(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Caller errors raised by the scheduler core.
#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    #[error("flow {0} is not registered")]
    UnknownFlow(FlowId),
}

/// Failures while wiring or running the ingress/dispatch pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
