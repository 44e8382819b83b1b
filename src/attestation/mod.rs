//! Attestation service seam
//!
//! The remote exchange itself is opaque: a client sends device/app identity
//! material and gets back either a token with an absolute expiry or a
//! classified failure:
//!
//! - `Network` - transient (connectivity, timeouts, 5xx, 429); retried by the store.
//! - `Rejected` - the device or app failed attestation (401/403).
//! - `Config` - the client is misconfigured (other 4xx, unreadable responses).

pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use types::{FetchRequest, TokenResponse};

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{AttestationError, Error, Result};
use crate::token::Token;

/// One remote attestation exchange.
///
/// Implementations perform a single attempt; retries, timeouts and
/// single-flight are the [`TokenStore`](crate::store::TokenStore)'s job.
#[async_trait]
pub trait AttestationClient: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Token, AttestationError>;
}

/// Attestation client speaking JSON over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpAttestationClient {
    url: reqwest::Url,
    http: reqwest::Client,
}

impl HttpAttestationClient {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_client(url, reqwest::Client::new())
    }

    /// Use a preconfigured client, e.g. one pinned to the attestation host.
    pub fn with_client(url: &str, http: reqwest::Client) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid attestation url '{}': {}", url, e)))?;
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

#[async_trait]
impl AttestationClient for HttpAttestationClient {
    async fn fetch(&self, request: &FetchRequest) -> std::result::Result<Token, AttestationError> {
        let response = self
            .http
            .post(self.url.clone())
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AttestationError::Config(format!("unreadable token response: {}", e)))?;

        Ok(body.into_token())
    }
}

fn classify_transport_error(e: reqwest::Error) -> AttestationError {
    if e.is_builder() {
        AttestationError::Config(format!("cannot build attestation request: {}", e))
    } else {
        AttestationError::Network(format!("HTTP request failed: {}", e))
    }
}

/// Map a non-success HTTP status from the service to a failure class.
pub fn classify_status(status: StatusCode, body: &str) -> AttestationError {
    let detail = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unknown error")
            .to_string()
    } else {
        body.chars().take(200).collect()
    };
    let message = format!("HTTP {}: {}", status.as_u16(), detail);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AttestationError::Rejected(message),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            AttestationError::Network(message)
        }
        s if s.is_server_error() => AttestationError::Network(message),
        _ => AttestationError::Config(message),
    }
}
