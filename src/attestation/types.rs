//! Wire types for the attestation exchange.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::token::{Binding, Token};

/// What the client asks the attestation service for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    /// Digest of the bind-header value to embed in the token claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

impl FetchRequest {
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn bound(binding: &Binding) -> Self {
        Self {
            binding: Some(binding.as_str().to_string()),
        }
    }
}

/// Successful response body from the attestation service.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token: String,

    /// Absolute expiry, seconds since the Unix epoch.
    pub expires_at: u64,

    #[serde(default = "default_valid")]
    pub valid: bool,
}

fn default_valid() -> bool {
    true
}

impl TokenResponse {
    pub fn into_token(self) -> Token {
        let expires_at = SystemTime::UNIX_EPOCH + Duration::from_secs(self.expires_at);
        if self.valid {
            Token::new(self.token, expires_at)
        } else {
            Token::invalid(self.token, expires_at)
        }
    }
}
