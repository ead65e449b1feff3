//! recon-engine - concurrent network reconnaissance core
//!
//! Expands target expressions, runs pluggable probes over them through
//! bounded worker pools under a shared rate limiter, and aggregates the
//! merged results into a deduplicated, deterministically ordered report.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod probe;
pub mod ratelimit;
pub mod session;
pub mod target;

// Re-export commonly used types
pub use aggregate::{Aggregator, Choice, Reducer};
pub use config::ReconConfig;
pub use error::{ReconError, ReconResult, ResultError, TransportError};
pub use orchestrator::{Orchestrator, RunState};
pub use output::{write_report, OutputFormat};
pub use pool::{PoolHandle, PoolStats, WorkerPool};
pub use probe::{Outcome, Payload, Probe, ProbeDescriptor, ProbeResult, ResultSink};
pub use ratelimit::{RateLimitRule, RateLimiter};
pub use session::{RetryPolicy, RetryingSession, Transport};
pub use target::{expand, expand_list, Target, TargetExpander, TargetKind};

pub type Result<T> = std::result::Result<T, ReconError>;
