//! Target data model
//!
//! A [`Target`] is one unit of reconnaissance work. Range targets only exist
//! transiently: the [`expander`] turns them into atomic targets before anything
//! is queued for a probe.

pub mod expander;

pub use expander::{expand, expand_list, TargetExpander, DEFAULT_MAX_EXPANSION};

use crate::error::{ReconError, ReconResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9])?)*\.?$",
    )
    .expect("hostname pattern is valid")
});

static ASN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)as[0-9]{1,10}$").expect("ASN pattern is valid"));

/// Kind tag for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Address,
    Range,
    Domain,
    Url,
    AutonomousSystem,
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Address => "address",
            TargetKind::Range => "range",
            TargetKind::Domain => "domain",
            TargetKind::Url => "url",
            TargetKind::AutonomousSystem => "asn",
        }
    }

    /// Only atomic kinds may reach a probe
    pub fn is_atomic(&self) -> bool {
        !matches!(self, TargetKind::Range)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable reconnaissance target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    value: String,
    kind: TargetKind,
}

impl Target {
    /// Classify a raw target expression.
    ///
    /// Domains are lower-cased; everything else keeps its original spelling.
    pub fn classify(input: &str) -> ReconResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReconError::InvalidAddress("empty target".to_string()));
        }

        if input.contains("://") {
            let url = reqwest::Url::parse(input)
                .map_err(|e| ReconError::InvalidAddress(format!("{}: {}", input, e)))?;
            if url.host_str().is_none() {
                return Err(ReconError::InvalidAddress(format!("{}: URL has no host", input)));
            }
            return Ok(Self::new(input, TargetKind::Url));
        }

        if ASN_RE.is_match(input) {
            return Ok(Self::new(input.to_uppercase(), TargetKind::AutonomousSystem));
        }

        if input.contains('/') {
            return Ok(Self::new(input, TargetKind::Range));
        }

        if input.parse::<IpAddr>().is_ok() || input.parse::<SocketAddr>().is_ok() {
            return Ok(Self::new(input, TargetKind::Address));
        }

        if is_hostname(input) {
            return Ok(Self::new(input.to_lowercase(), TargetKind::Domain));
        }

        Err(ReconError::InvalidAddress(input.to_string()))
    }

    pub(crate) fn new(value: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    pub fn address(ip: IpAddr) -> Self {
        Self::new(ip.to_string(), TargetKind::Address)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// IP address of an address target (with or without an explicit port)
    pub fn ip(&self) -> Option<IpAddr> {
        if self.kind != TargetKind::Address {
            return None;
        }
        self.value
            .parse::<IpAddr>()
            .ok()
            .or_else(|| self.socket_addr().map(|s| s.ip()))
    }

    /// Explicit `ip:port` form of an address target
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        if self.kind != TargetKind::Address {
            return None;
        }
        self.value.parse::<SocketAddr>().ok()
    }

    /// Host part of the target, used for keys and lookups
    pub fn host(&self) -> String {
        match self.kind {
            TargetKind::Address => self
                .ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| self.value.clone()),
            TargetKind::Domain => self.value.trim_end_matches('.').to_string(),
            TargetKind::Url => reqwest::Url::parse(&self.value)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
                .unwrap_or_else(|| self.value.clone()),
            TargetKind::Range | TargetKind::AutonomousSystem => self.value.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl std::str::FromStr for Target {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::classify(s)
    }
}

fn is_hostname(input: &str) -> bool {
    if input.len() > 253 || !HOSTNAME_RE.is_match(input) {
        return false;
    }
    // "999.1.1.1" matches the label grammar but is a malformed address
    !input
        .trim_end_matches('.')
        .split('.')
        .all(|label| label.chars().all(|c| c.is_ascii_digit()))
}
