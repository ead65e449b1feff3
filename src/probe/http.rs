//! HTTP endpoint probe
//!
//! Fetches the root (or the given URL) of a web target through a
//! [`RetryingSession`] and records status, size and server banner.

use super::{HttpStatus, Payload, Probe, ResultSink};
use crate::error::ReconResult;
use crate::ratelimit::RateLimiter;
use crate::session::{Method, Request, RetryPolicy, RetryingSession, Transport};
use crate::target::{Target, TargetKind};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct HttpProbe {
    name: String,
    session: RetryingSession,
    method: Method,
    scheme: &'static str,
}

impl HttpProbe {
    pub fn new(transport: Arc<dyn Transport>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self::named("http", transport, limiter, policy)
    }

    /// The session's rate-limit key follows the probe name
    pub fn named(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        let name = name.into();
        Self {
            session: RetryingSession::new(transport, limiter, name.clone(), policy),
            name,
            method: Method::GET,
            scheme: "http",
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Scheme used when a bare host or address is given
    pub fn with_https(mut self) -> Self {
        self.scheme = "https";
        self
    }

    pub fn url_for(&self, target: &Target) -> String {
        match target.kind() {
            TargetKind::Url => target.value().to_string(),
            TargetKind::Address => match target.socket_addr() {
                Some(addr) => format!("{}://{}/", self.scheme, addr),
                None => match target.ip() {
                    Some(IpAddr::V6(ip)) => format!("{}://[{}]/", self.scheme, ip),
                    _ => format!("{}://{}/", self.scheme, target.host()),
                },
            },
            _ => format!("{}://{}/", self.scheme, target.host()),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    /// Bare addresses are fetched over the default scheme
    fn accepts(&self, kind: TargetKind) -> bool {
        matches!(kind, TargetKind::Url | TargetKind::Domain | TargetKind::Address)
    }

    async fn run(
        &self,
        target: &Target,
        sink: &ResultSink,
        cancel: &CancellationToken,
    ) -> ReconResult<()> {
        let url = self.url_for(target);
        let request = Request::new(self.method.clone(), url.clone());
        let response = self.session.execute(&request, cancel).await?;

        let content_length = response
            .header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .or_else(|| (!response.body.is_empty()).then_some(response.body.len() as u64));

        log::debug!("[{}] {} -> {}", self.name, url, response.status);
        sink.finding(Payload::Http(HttpStatus {
            url,
            status: response.status,
            content_length,
            server: response.header("server").map(str::to_string),
        }));
        Ok(())
    }
}
