//! Error handling for the recon engine
//!
//! Validation and orchestration errors are returned to the caller and abort
//! only the operation that produced them. Per-target and per-attempt errors
//! are captured into a [`crate::probe::ProbeResult`] instead of being
//! propagated, so one failing target never stops its siblings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for reconnaissance operations
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Non-retryable status {status} from {url}")]
    NonRetryableStatus { status: u16, url: String },

    #[error("Probe '{probe}' failed: {message}")]
    Probe { probe: String, message: String },

    #[error("Probe '{0}' is already registered")]
    DuplicateProbe(String),

    #[error("Unknown probe: {0}")]
    UnknownProbe(String),

    #[error("Probe '{0}' has already been started")]
    ProbeAlreadyStarted(String),

    #[error("Orchestrator is stopping or stopped")]
    OrchestratorStopped,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(String),
}

/// Failure of a single transport attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset")]
    ConnectionReset,

    #[error("timed out")]
    Timeout,

    #[error("server error status {0}")]
    ServerError(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether another attempt could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionRefused
                | TransportError::ConnectionReset
                | TransportError::Timeout
                | TransportError::ServerError(_)
                | TransportError::Other(_)
        )
    }

    /// Classify an IO error raised while talking to a peer
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                TransportError::ConnectionReset
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => {
                TransportError::Malformed(error.to_string())
            }
            _ => TransportError::Other(error.to_string()),
        }
    }
}

/// Result type alias for recon operations
pub type ReconResult<T> = Result<T, ReconError>;

impl ReconError {
    /// Short, stable label used when an error is recorded into a result
    pub fn kind(&self) -> &'static str {
        match self {
            ReconError::InvalidRange(_) => "invalid_range",
            ReconError::InvalidAddress(_) => "invalid_address",
            ReconError::Transport { source, .. } => match source {
                TransportError::Timeout => "timeout",
                _ => "transport",
            },
            ReconError::NonRetryableStatus { .. } => "non_retryable_status",
            ReconError::Probe { .. } => "probe",
            ReconError::DuplicateProbe(_) => "duplicate_probe",
            ReconError::UnknownProbe(_) => "unknown_probe",
            ReconError::ProbeAlreadyStarted(_) => "probe_already_started",
            ReconError::OrchestratorStopped => "orchestrator_stopped",
            ReconError::Cancelled => "cancelled",
            ReconError::Config(_) => "config",
            ReconError::Io(_) => "io",
            ReconError::Output(_) => "output",
        }
    }

    /// Build a per-target probe error
    pub fn probe(probe: impl Into<String>, message: impl Into<String>) -> Self {
        ReconError::Probe {
            probe: probe.into(),
            message: message.into(),
        }
    }

    /// Expected during shutdown; callers should not report it as a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ReconError::Cancelled)
    }
}

/// Serializable snapshot of an error captured into a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub kind: String,
    pub message: String,
}

impl From<&ReconError> for ResultError {
    fn from(e: &ReconError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for ResultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Convert common errors to ReconError
impl From<std::net::AddrParseError> for ReconError {
    fn from(e: std::net::AddrParseError) -> Self {
        ReconError::InvalidAddress(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for ReconError {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        ReconError::InvalidRange(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ReconError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ReconError::Transport {
            attempts: 1,
            source: TransportError::Timeout,
        }
    }
}

impl From<toml::de::Error> for ReconError {
    fn from(e: toml::de::Error) -> Self {
        ReconError::Config(format!("Failed to parse TOML: {}", e))
    }
}

impl From<serde_json::Error> for ReconError {
    fn from(e: serde_json::Error) -> Self {
        ReconError::Output(e.to_string())
    }
}

impl From<csv::Error> for ReconError {
    fn from(e: csv::Error) -> Self {
        ReconError::Output(e.to_string())
    }
}
