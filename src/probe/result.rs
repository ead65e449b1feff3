//! Result types emitted by probes

use crate::config::duration_ms;
use crate::error::{ReconError, ResultError};
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Port reachability finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub address: IpAddr,
    pub port: u16,
    pub open: bool,
    pub insecure: bool,
    pub service: Option<String>,
}

/// Forward lookup finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// HTTP endpoint finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpStatus {
    pub url: String,
    pub status: u16,
    pub content_length: Option<u64>,
    pub server: Option<String>,
}

/// Probe-specific data carried by a finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Port(PortStatus),
    Resolution(Resolution),
    Http(HttpStatus),
    /// Free-form data for custom probes
    Data(serde_json::Value),
}

impl Payload {
    pub fn port(&self) -> Option<&PortStatus> {
        match self {
            Payload::Port(status) => Some(status),
            _ => None,
        }
    }
}

/// Either a finding, an isolated error, or nothing found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Finding(Payload),
    Failure(ResultError),
    Empty,
}

/// One immutable output record of a probe invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub source: String,
    pub target: Target,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ProbeResult {
    pub fn new(source: impl Into<String>, target: Target, outcome: Outcome) -> Self {
        Self {
            source: source.into(),
            target,
            outcome,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Finding(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ResultError> {
        match &self.outcome {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_finding(&self) -> bool {
        matches!(self.outcome, Outcome::Finding(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failure(_))
    }

    /// Invocation interrupted by shutdown
    pub fn is_cancelled(&self) -> bool {
        self.error().is_some_and(|e| e.kind == "cancelled")
    }

    pub fn port_status(&self) -> Option<&PortStatus> {
        self.payload().and_then(Payload::port)
    }
}

/// Write-only destination for the results of one probe invocation.
///
/// The sink stamps every result with the probe name, the target and the
/// invocation start time, and counts what was emitted.
#[derive(Debug, Clone)]
pub struct ResultSink {
    source: Arc<str>,
    target: Target,
    started_at: DateTime<Utc>,
    started: Instant,
    sender: mpsc::UnboundedSender<ProbeResult>,
    emitted: Arc<AtomicUsize>,
}

impl ResultSink {
    pub fn new(
        source: impl Into<Arc<str>>,
        target: Target,
        sender: mpsc::UnboundedSender<ProbeResult>,
    ) -> Self {
        Self {
            source: source.into(),
            target,
            started_at: Utc::now(),
            started: Instant::now(),
            sender,
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn finding(&self, payload: Payload) {
        self.emit(Outcome::Finding(payload));
    }

    pub fn failure(&self, error: &ReconError) {
        self.emit(Outcome::Failure(ResultError::from(error)));
    }

    pub fn empty(&self) {
        self.emit(Outcome::Empty);
    }

    /// Number of results emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    fn emit(&self, outcome: Outcome) {
        let result = ProbeResult {
            source: self.source.to_string(),
            target: self.target.clone(),
            outcome,
            started_at: self.started_at,
            duration: self.started.elapsed(),
        };
        self.emitted.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(result).is_err() {
            log::debug!("[{}] result for {} dropped: stream closed", self.source, self.target);
        }
    }
}
