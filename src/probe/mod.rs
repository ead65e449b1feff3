//! Probe trait and reference probes
//!
//! A probe inspects one target and emits zero or more results through a
//! [`ResultSink`]. A failure for one target is reported as a result with an
//! error and never aborts sibling targets or sibling probes.

pub mod http;
pub mod reachability;
pub mod resolve;
pub mod result;

pub use http::HttpProbe;
pub use reachability::{ReachabilityProbe, INSECURE_PORTS};
pub use resolve::{NameResolver, ResolveProbe, StaticResolver, SystemResolver};
pub use result::{HttpStatus, Outcome, Payload, PortStatus, ProbeResult, Resolution, ResultSink};

use crate::error::ReconResult;
use crate::target::{Target, TargetKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Registry metadata for a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    /// Unique name, also the rate-limit key and result tag
    pub name: String,
    /// Run each invocation in its own task so a panic only fails that target
    pub isolation: bool,
}

impl ProbeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolation: true,
        }
    }

    pub fn with_isolation(mut self, isolation: bool) -> Self {
        self.isolation = isolation;
        self
    }
}

/// Pluggable unit of reconnaissance work
#[async_trait]
pub trait Probe: Send + Sync {
    /// Stable name used as rate-limit key and result tag
    fn name(&self) -> &str;

    fn descriptor(&self) -> ProbeDescriptor {
        ProbeDescriptor::new(self.name())
    }

    /// Whether targets of this kind can be handed to [`Probe::run`]
    fn accepts(&self, kind: TargetKind) -> bool {
        kind.is_atomic()
    }

    /// Inspect one target.
    ///
    /// Any internal fan-out must be finished by the time this returns, and
    /// must stop starting new work once `cancel` fires. An `Err` is recorded
    /// by the worker pool as a failure result for this target only.
    async fn run(
        &self,
        target: &Target,
        sink: &ResultSink,
        cancel: &CancellationToken,
    ) -> ReconResult<()>;
}

/// Well-known service name for a TCP port
pub fn service_name(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "domain",
        80 => "http",
        110 => "pop3",
        111 => "rpcbind",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        443 => "https",
        445 => "microsoft-ds",
        993 => "imaps",
        995 => "pop3s",
        1433 => "mssql",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5900 => "vnc",
        5984 => "couchdb",
        6379 => "redis",
        8080 => "http-proxy",
        8443 => "https-alt",
        27017 => "mongodb",
        _ => return None,
    };
    Some(name)
}
