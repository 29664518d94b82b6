//! Weighted Fair Queuing datagram scheduler.
//!
//! Datagrams arrive on several flows (identified by UDP source port), receive a virtual finish time
//! proportional to their flow's weight, wait in a bounded buffer that drops the worst-VFT packet
//! under pressure, and leave in VFT order at a fixed service rate.

pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod packet;
pub mod pipeline;
pub mod scheduler;
pub mod threading;

pub use config::WfqConfig;
pub use error::{ConfigError, PipelineError, SchedulerError};
pub use flow::{FlowId, FlowRegistry};
pub use pipeline::Pipeline;
pub use scheduler::{Admission, WfqScheduler};
