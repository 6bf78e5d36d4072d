//! Fleet Runner
//!
//! Everything that touches blocking remote execution lives here:
//! - Executor: the `RemoteExecutor` seam and a process-backed implementation
//! - Decoder: turns raw output chunks into clean lines and result envelopes
//! - Service: the remote task service, one worker pool per task category
//!
//! Blocking calls never run on the caller's async scheduler. They are handed
//! to dedicated pool threads and the caller awaits a channel instead.

pub mod config;
pub mod decoder;
pub mod executor;
pub mod service;

pub use config::{PoolConfig, TaskServiceConfig};
pub use decoder::{DecodedLine, StreamDecoder};
pub use executor::{
    ExecutorError, OutputChunk, OutputSink, OutputStream, ProcessExecutor, RemoteCommand,
    RemoteExecutor,
};
pub use service::{
    PoolMetrics, RemoteTaskService, ResourceLimits, ResourceProbe, ResourceSample, ScalingState,
    Settled, StaticProbe, SystemProbe, TaskCategory, TaskContext, TaskError, TaskServiceMetrics,
};
