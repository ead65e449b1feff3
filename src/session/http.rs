//! HTTP transport backed by reqwest

use super::{Request, Response, Transport};
use crate::error::{ReconError, ReconResult, TransportError};
use async_trait::async_trait;
use std::time::Duration;

/// Shared HTTP client, built once per run and passed to every session
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> ReconResult<Self> {
        Self::with_options(timeout, false)
    }

    /// `accept_invalid_certs` skips certificate verification, which recon
    /// targets with self-signed certificates need
    pub fn with_options(timeout: Duration, accept_invalid_certs: bool) -> ReconResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .user_agent(concat!("recon-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReconError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Map a reqwest failure onto the retry taxonomy
fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }
    if error.is_builder() || error.is_decode() || error.is_redirect() {
        return TransportError::Malformed(error.to_string());
    }

    let mut source = std::error::Error::source(&error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return TransportError::from_io(io);
        }
        source = inner.source();
    }

    if error.is_connect() {
        TransportError::ConnectionRefused
    } else {
        TransportError::Other(error.to_string())
    }
}
