//! Attestation tokens, bindings and time sources.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// A short-lived attestation token.
///
/// Immutable once issued. The store hands tokens out behind an `Arc`; a newer
/// token supersedes an older one, it is never edited in place.
pub struct Token {
    value: Zeroizing<String>,
    expires_at: SystemTime,
    valid: bool,
    binding: Option<Binding>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            expires_at,
            valid: true,
            binding: None,
        }
    }

    /// A token the service issued but flagged as not valid (e.g. a placeholder
    /// returned alongside a failure).
    pub fn invalid(value: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            valid: false,
            ..Self::new(value, expires_at)
        }
    }

    pub(crate) fn with_binding(mut self, binding: Option<Binding>) -> Self {
        self.binding = binding;
        self
    }

    /// The bearer string. Never log this.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Whether the token may still be attached at `now`, keeping `margin` in reserve.
    pub fn is_usable_at(&self, now: SystemTime, margin: Duration) -> bool {
        if !self.valid {
            return false;
        }
        match now.checked_add(margin) {
            Some(deadline) => deadline < self.expires_at,
            None => false,
        }
    }

    /// Constant-time comparison against a header value candidate.
    pub fn matches(&self, other: &str) -> bool {
        let a = self.value.as_bytes();
        let b = other.as_bytes();
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("valid", &self.valid)
            .field("binding", &self.binding)
            .finish()
    }
}

/// SHA-256 digest of a bind-header value, hex encoded.
///
/// The raw value (often another credential) never leaves the request; only
/// its digest is sent to the attestation service and used as a slot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding(String);

impl Binding {
    pub fn from_value(value: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of wall-clock time for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_usable_until_expiry() {
        let token = Token::new("tok", at(100));
        assert!(token.is_usable_at(at(99), Duration::ZERO));
        assert!(!token.is_usable_at(at(100), Duration::ZERO));
        assert!(!token.is_usable_at(at(101), Duration::ZERO));
    }

    #[test]
    fn test_margin_shortens_lifetime() {
        let token = Token::new("tok", at(100));
        assert!(!token.is_usable_at(at(95), Duration::from_secs(5)));
        assert!(token.is_usable_at(at(94), Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_token_never_usable() {
        let token = Token::invalid("tok", at(100));
        assert!(!token.is_usable_at(at(0), Duration::ZERO));
    }

    #[test]
    fn test_debug_redacts_value() {
        let token = Token::new("secret-token", at(100));
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_binding_is_digest() {
        let binding = Binding::from_value(b"Bearer abc");
        assert_eq!(binding.as_str().len(), 64);
        assert_eq!(binding, Binding::from_value(b"Bearer abc"));
        assert_ne!(binding, Binding::from_value(b"Bearer abd"));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(at(10));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), at(15));
    }
}
