//! TCP reachability probe
//!
//! Connects to every configured port of an address (or to the explicit port
//! of an `ip:port` target) and reports open ports, flagging well-known
//! insecure services.

use super::resolve::{NameResolver, SystemResolver};
use super::{service_name, Payload, PortStatus, Probe, ResultSink};
use crate::error::{ReconError, ReconResult};
use crate::ratelimit::RateLimiter;
use crate::target::{Target, TargetKind};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Ports flagged as insecure when found open
pub const INSECURE_PORTS: [u16; 12] = [21, 22, 23, 25, 53, 80, 110, 143, 443, 445, 3389, 5900];

/// Connections in flight per target
const DEFAULT_FANOUT: usize = 64;

enum PortState {
    Open,
    Closed,
    Filtered,
}

/// TCP connect probe with timeout
pub struct ReachabilityProbe {
    name: String,
    ports: Vec<u16>,
    timeout: Duration,
    insecure: HashSet<u16>,
    fanout: usize,
    limiter: Option<Arc<RateLimiter>>,
    resolver: Arc<dyn NameResolver>,
}

impl ReachabilityProbe {
    pub fn new(ports: Vec<u16>, timeout: Duration) -> Self {
        Self {
            name: "reachability".to_string(),
            ports,
            timeout,
            insecure: INSECURE_PORTS.iter().copied().collect(),
            fanout: DEFAULT_FANOUT,
            limiter: None,
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_insecure_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.insecure = ports.into_iter().collect();
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    /// Take one token per connection attempt, keyed by the probe name
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn is_insecure(&self, port: u16) -> bool {
        self.insecure.contains(&port)
    }

    async fn endpoints(&self, target: &Target) -> ReconResult<Vec<SocketAddr>> {
        if let Some(addr) = target.socket_addr() {
            return Ok(vec![addr]);
        }

        let ips: Vec<IpAddr> = match target.kind() {
            TargetKind::Address => target.ip().into_iter().collect(),
            TargetKind::Domain => {
                let host = target.host();
                let mut ips = tokio::time::timeout(self.timeout, self.resolver.lookup(&host))
                    .await
                    .map_err(|_| ReconError::probe(&self.name, format!("resolving {} timed out", host)))?
                    .map_err(|e| ReconError::probe(&self.name, format!("failed to resolve {}: {}", host, e)))?;
                ips.sort();
                ips.dedup();
                ips
            }
            kind => {
                return Err(ReconError::InvalidAddress(format!(
                    "{} targets are not supported by {}",
                    kind, self.name
                )))
            }
        };

        Ok(ips
            .into_iter()
            .flat_map(|ip| self.ports.iter().map(move |&port| SocketAddr::new(ip, port)))
            .collect())
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<PortState> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(PortState::Open),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(PortState::Closed),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(PortState::Filtered),
    }
}

#[async_trait]
impl Probe for ReachabilityProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        matches!(kind, TargetKind::Address | TargetKind::Domain)
    }

    async fn run(
        &self,
        target: &Target,
        sink: &ResultSink,
        cancel: &CancellationToken,
    ) -> ReconResult<()> {
        let endpoints = self.endpoints(target).await?;
        let semaphore = Arc::new(Semaphore::new(self.fanout));
        let mut tasks = JoinSet::new();
        let mut interrupted = false;

        for addr in endpoints {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if let Some(limiter) = &self.limiter {
                if limiter.acquire(&self.name, cancel).await.is_err() {
                    interrupted = true;
                    break;
                }
            }

            let timeout = self.timeout;
            tasks.spawn(async move {
                let _permit = permit;
                (addr, connect(addr, timeout).await)
            });
        }

        // In-flight connects are bounded by their own timeout
        while let Some(joined) = tasks.join_next().await {
            let (addr, state) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("[{}] connect task for {} failed: {}", self.name, target, e);
                    continue;
                }
            };

            match state {
                Ok(PortState::Open) => {
                    let insecure = self.is_insecure(addr.port());
                    log::debug!(
                        "[{}] {} open{}",
                        self.name,
                        addr,
                        if insecure { " (insecure)" } else { "" }
                    );
                    sink.finding(Payload::Port(PortStatus {
                        address: addr.ip(),
                        port: addr.port(),
                        open: true,
                        insecure,
                        service: service_name(addr.port()).map(str::to_string),
                    }));
                }
                Ok(PortState::Closed) => log::trace!("[{}] {} closed", self.name, addr),
                Ok(PortState::Filtered) => log::trace!("[{}] {} filtered", self.name, addr),
                Err(e) => sink.failure(&ReconError::probe(&self.name, format!("{}: {}", addr, e))),
            }
        }

        if interrupted {
            return Err(ReconError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_reports_open_ports_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let probe = ReachabilityProbe::new(vec![open, closed], Duration::from_secs(2))
            .with_insecure_ports([open]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = Target::classify("127.0.0.1").unwrap();
        let sink = ResultSink::new(probe.name(), target.clone(), tx);

        probe.run(&target, &sink, &CancellationToken::new()).await.unwrap();
        drop(sink);

        let mut findings = Vec::new();
        while let Some(result) = rx.recv().await {
            findings.push(result);
        }
        assert_eq!(findings.len(), 1);
        let status = findings[0].port_status().unwrap();
        assert_eq!(status.port, open);
        assert!(status.open && status.insecure);
    }

    #[tokio::test]
    async fn test_explicit_port_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = ReachabilityProbe::new(vec![1], Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = Target::classify(&addr.to_string()).unwrap();
        let sink = ResultSink::new(probe.name(), target.clone(), tx);

        probe.run(&target, &sink, &CancellationToken::new()).await.unwrap();
        let result = rx.try_recv().unwrap();
        assert_eq!(result.port_status().unwrap().port, addr.port());
        assert!(!result.port_status().unwrap().insecure);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let probe = ReachabilityProbe::new(vec![closed_port().await], Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = Target::classify("127.0.0.1").unwrap();
        let sink = ResultSink::new(probe.name(), target.clone(), tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = probe.run(&target, &sink, &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(sink.emitted(), 0);
    }

    #[test]
    fn test_default_insecure_set() {
        let probe = ReachabilityProbe::new(vec![], Duration::from_secs(1));
        for port in [21, 22, 443, 3389] {
            assert!(probe.is_insecure(port));
        }
        assert!(!probe.is_insecure(8080));
    }
}
