//! Forward name resolution probe

use super::{Payload, Probe, Resolution, ResultSink};
use crate::error::{ReconError, ReconResult, TransportError};
use crate::ratelimit::RateLimiter;
use crate::target::{Target, TargetKind};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Forward lookup seam
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn lookup(&self, name: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver using the system's configured name service
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn lookup(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Fixed name table, for offline runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: &str, addresses: Vec<IpAddr>) -> Self {
        self.entries.insert(name.to_lowercase(), addresses);
        self
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn lookup(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        self.entries
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such host: {}", name)))
    }
}

/// Resolves domain (and URL host) targets to their addresses
pub struct ResolveProbe {
    name: String,
    resolver: Arc<dyn NameResolver>,
    timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
}

impl ResolveProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::with_resolver(Arc::new(SystemResolver), timeout)
    }

    pub fn with_resolver(resolver: Arc<dyn NameResolver>, timeout: Duration) -> Self {
        Self {
            name: "resolve".to_string(),
            resolver,
            timeout,
            limiter: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[async_trait]
impl Probe for ResolveProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, kind: TargetKind) -> bool {
        matches!(kind, TargetKind::Domain | TargetKind::Url)
    }

    async fn run(
        &self,
        target: &Target,
        sink: &ResultSink,
        cancel: &CancellationToken,
    ) -> ReconResult<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(&self.name, cancel).await?;
        }

        let host = target.host();
        let addresses = match tokio::time::timeout(self.timeout, self.resolver.lookup(&host)).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(e)) => {
                return Err(ReconError::probe(
                    &self.name,
                    format!("failed to resolve {}: {}", host, e),
                ))
            }
            Err(_) => {
                return Err(ReconError::Transport {
                    attempts: 1,
                    source: TransportError::Timeout,
                })
            }
        };

        let addresses: Vec<IpAddr> = addresses.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        log::debug!("[{}] {} resolved to {} address(es)", self.name, host, addresses.len());

        if !addresses.is_empty() {
            sink.finding(Payload::Resolution(Resolution {
                name: host,
                addresses,
            }));
        }
        Ok(())
    }
}
