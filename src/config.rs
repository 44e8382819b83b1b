//! Session configuration.
//!
//! Everything the attestation layer needs is read from one [`AttestConfig`],
//! usually deserialized from JSON. Durations use humantime notation
//! (`"10s"`, `"250ms"`).

use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pinning::{is_well_formed_pin, PinSet};

/// What to do with a request when no attestation token can be obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Abort the request and surface the error (default).
    #[default]
    Closed,
    /// Dispatch the request without an attestation header.
    Open,
}

/// Pinning decision for hosts absent from the pin set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPolicy {
    /// Refuse the handshake (default).
    #[default]
    Reject,
    /// Accept any chain that passed standard validation.
    Allow,
}

/// Retry and timeout policy applied by the token store to each fetch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub fetch_timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Configuration for an attested session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestConfig {
    /// Endpoint of the attestation service. Its host is never intercepted.
    #[serde(default)]
    pub attestation_url: Option<String>,

    /// Header whose value is bound into the attestation claim.
    #[serde(default)]
    pub bind_header_name: Option<String>,

    /// Header carrying the attestation token (default: "Attestation-Token").
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Prepended to the token in the header value, e.g. "Bearer ".
    #[serde(default)]
    pub token_prefix: String,

    /// Host -> acceptable SPKI pins.
    #[serde(default)]
    pub pin_set: PinSet,

    /// Refuse to start with an empty pin set.
    #[serde(default)]
    pub require_pins: bool,

    #[serde(default)]
    pub fail_policy: FailPolicy,

    #[serde(default)]
    pub default_host_policy: HostPolicy,

    /// Hosts that never receive a token (exact match or `*.suffix`).
    #[serde(default)]
    pub excluded_hosts: Vec<String>,

    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Tokens closer than this to expiry are treated as expired.
    #[serde(default, with = "humantime_serde")]
    pub expiry_margin: Duration,
}

impl Default for AttestConfig {
    fn default() -> Self {
        Self {
            attestation_url: None,
            bind_header_name: None,
            token_header: default_token_header(),
            token_prefix: String::new(),
            pin_set: PinSet::default(),
            require_pins: false,
            fail_policy: FailPolicy::Closed,
            default_host_policy: HostPolicy::Reject,
            excluded_hosts: Vec::new(),
            fetch_timeout: default_fetch_timeout(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            expiry_margin: Duration::ZERO,
        }
    }
}

fn default_token_header() -> String {
    "Attestation-Token".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}

impl AttestConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AttestConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for mistakes that would only show up per request.
    pub fn validate(&self) -> Result<()> {
        parse_header_name(&self.token_header)?;
        if let Some(ref bind) = self.bind_header_name {
            parse_header_name(bind)?;
        }

        if let Some(ref url) = self.attestation_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| Error::Config(format!("invalid attestation_url '{}': {}", url, e)))?;
            if parsed.host_str().is_none() {
                return Err(Error::Config(format!(
                    "attestation_url '{}' has no host",
                    url
                )));
            }
        }

        if self.fetch_timeout.is_zero() {
            return Err(Error::Config("fetch_timeout must be non-zero".into()));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Config(
                "max_backoff must not be shorter than initial_backoff".into(),
            ));
        }

        if self.require_pins && self.pin_set.is_empty() {
            return Err(Error::Config(
                "require_pins is set but pin_set is empty".into(),
            ));
        }
        for (host, pins) in self.pin_set.iter() {
            if let Some(bad) = pins.iter().find(|p| !is_well_formed_pin(p)) {
                return Err(Error::Config(format!(
                    "malformed pin '{}' for host '{}'",
                    bad, host
                )));
            }
        }

        Ok(())
    }

    /// The retry policy the token store applies to fetch chains.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            fetch_timeout: self.fetch_timeout,
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }

    /// Host of the attestation endpoint, if one is configured.
    pub fn attestation_host(&self) -> Option<String> {
        self.attestation_url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::Config(format!("invalid header name '{}'", name)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const PIN_A: &str = "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=";

    #[test]
    fn test_default_config() {
        let config = AttestConfig::default();
        assert_eq!(config.fail_policy, FailPolicy::Closed);
        assert_eq!(config.default_host_policy, HostPolicy::Reject);
        assert_eq!(config.token_header, "Attestation-Token");
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let json = format!(
            r#"{{
                "attestation_url": "https://attest.example.com/v1/token",
                "bind_header_name": "Authorization",
                "pin_set": {{ "api.example.com": ["{}"] }},
                "fail_policy": "open",
                "default_host_policy": "allow",
                "fetch_timeout": "250ms",
                "max_retries": 5
            }}"#,
            PIN_A
        );
        let config = AttestConfig::from_json_str(&json).unwrap();
        assert_eq!(config.fail_policy, FailPolicy::Open);
        assert_eq!(config.default_host_policy, HostPolicy::Allow);
        assert_eq!(config.fetch_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.attestation_host().as_deref(), Some("attest.example.com"));
        assert_eq!(config.bind_header_name.as_deref(), Some("Authorization"));
    }

    #[test]
    fn test_require_pins_with_empty_set() {
        let config = AttestConfig {
            require_pins: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_pin_rejected() {
        let json = r#"{ "pin_set": { "api.example.com": ["not-a-pin"] } }"#;
        assert!(matches!(
            AttestConfig::from_json_str(json),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_bind_header_rejected() {
        let config = AttestConfig {
            bind_header_name: Some("bad header".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attest.json");
        std::fs::write(&path, r#"{ "excluded_hosts": ["*.internal"] }"#).unwrap();
        let config = AttestConfig::from_file(&path).unwrap();
        assert_eq!(config.excluded_hosts, vec!["*.internal"]);
    }
}
