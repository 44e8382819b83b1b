//! Error types for the attested session.

use thiserror::Error;

/// Failure classification for a remote attestation exchange.
///
/// `Clone` because one fetch outcome is handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    /// Transient failure (connectivity, timeout, overloaded service). Retryable.
    #[error("attestation network error: {0}")]
    Network(String),

    /// The device or app failed attestation. Terminal until an explicit reset.
    #[error("attestation rejected: {0}")]
    Rejected(String),

    /// The client is misconfigured. Terminal until an explicit reset.
    #[error("attestation misconfigured: {0}")]
    Config(String),
}

impl AttestationError {
    /// Whether the store may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttestationError::Network(_))
    }
}

/// A TLS peer presented no certificate matching the host's pins.
///
/// Kept apart from [`AttestationError`]: this is a transport-trust decision and
/// is never subject to fail-open. Tasks report it as
/// [`TransportError::Pinning`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pinning rejected for {host}: {reason}")]
pub struct PinningRejected {
    pub host: String,
    pub reason: String,
}

/// Why a request could not be intercepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptionError {
    /// Fail-closed policy aborted the request after an attestation failure.
    #[error("request aborted: {0}")]
    Attestation(#[from] AttestationError),

    #[error("request has no target host: {0}")]
    NoHost(String),
}

/// Failures reported by a transport while creating or running a task.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The handshake was aborted because no presented key matched the pins.
    #[error(transparent)]
    Pinning(#[from] PinningRejected),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport does not support {0} tasks")]
    Unsupported(&'static str),

    #[error("transport invalidated")]
    Invalidated,

    #[error("task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Interception(#[from] InterceptionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
