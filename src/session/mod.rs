//! Retrying request/response sessions
//!
//! A [`RetryingSession`] wraps one [`Transport`] with a fixed per-attempt
//! timeout, a bounded retry policy and the shared rate limiter. Transient
//! failures (refused or reset connections, timeouts, 5xx responses) are
//! retried; 4xx responses and malformed replies return at once.

pub mod http;

pub use http::HttpTransport;

use crate::error::{ReconError, ReconResult, TransportError};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use reqwest::Method;

/// Outgoing request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }
}

/// Response from a transport
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// Something that can carry one request attempt
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Bounded retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_millis(500),
            per_attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration, per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            per_attempt_timeout,
        }
    }
}

/// Rate-limited executor with retries
pub struct RetryingSession {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    key: String,
    policy: RetryPolicy,
}

impl RetryingSession {
    /// `key` selects the rate-limit bucket; probes pass their own name
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        key: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            key: key.into(),
            policy,
        }
    }

    /// Execute `request`, retrying transient failures.
    ///
    /// One rate-limit token is taken per call. The wait between attempts is
    /// interrupted by `cancel`; an attempt already in flight runs until it
    /// completes or hits its timeout.
    pub async fn execute(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> ReconResult<Response> {
        self.limiter.acquire(&self.key, cancel).await?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let sent = tokio::time::timeout(
                self.policy.per_attempt_timeout,
                self.transport.send(request),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));

            let failure = match sent {
                Ok(response) if response.is_server_error() => {
                    TransportError::ServerError(response.status)
                }
                Ok(response) if response.is_client_error() => {
                    return Err(ReconError::NonRetryableStatus {
                        status: response.status,
                        url: request.url.clone(),
                    });
                }
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            if !failure.is_transient() || attempt >= max_attempts {
                log::debug!(
                    "[{}] {} {} failed after {} attempt(s): {}",
                    self.key,
                    request.method,
                    request.url,
                    attempt,
                    failure
                );
                return Err(ReconError::Transport {
                    attempts: attempt,
                    source: failure,
                });
            }

            log::debug!(
                "[{}] Retrying {} (attempt {}/{}): {}",
                self.key,
                request.url,
                attempt + 1,
                max_attempts,
                failure
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReconError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays a fixed script of outcomes, repeating the last one
    struct ScriptedTransport {
        script: Vec<Result<u16, TransportError>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<u16, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &Request) -> Result<Response, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = self.script[n.min(self.script.len() - 1)].clone();
            step.map(Response::new)
        }
    }

    fn session(transport: Arc<ScriptedTransport>, max_attempts: u32) -> RetryingSession {
        RetryingSession::new(
            transport,
            Arc::new(RateLimiter::unlimited()),
            "http",
            RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_immediately() {
        let transport = ScriptedTransport::new(vec![Ok(200)]);
        let session = session(transport.clone(), 3);
        let response = session
            .execute(&Request::get("http://a/"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_then_success() {
        let transport = ScriptedTransport::new(vec![Ok(503), Err(TransportError::ConnectionReset), Ok(204)]);
        let session = session(transport.clone(), 3);
        let response = session
            .execute(&Request::get("http://a/"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(404)]);
        let session = session(transport.clone(), 5);
        let err = session
            .execute(&Request::get("http://a/missing"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::NonRetryableStatus { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Malformed("junk".into()))]);
        let session = session(transport.clone(), 5);
        let err = session
            .execute(&Request::get("http://a/"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::Transport { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_attempts() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::ConnectionRefused)]);
        let session = session(transport.clone(), 4);
        let err = session
            .execute(&Request::get("http://a/"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ReconError::Transport { attempts, source } => {
                assert_eq!(attempts, 4);
                assert_eq!(source, TransportError::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout)]);
        let session = RetryingSession::new(
            transport.clone(),
            Arc::new(RateLimiter::unlimited()),
            "http",
            RetryPolicy::new(10, Duration::from_secs(60), Duration::from_secs(1)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = session.execute(&Request::get("http://a/"), &cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_response_header_lookup() {
        let mut response = Response::new(200);
        response.headers.push(("Server".to_string(), "nginx".to_string()));
        assert_eq!(response.header("server"), Some("nginx"));
        assert!(response.header("x-missing").is_none());
    }
}
