//! Per-host public key pinning.
//!
//! A pin is the base64 SHA-256 digest of a certificate's DER-encoded
//! SubjectPublicKeyInfo (see [`crate::tls::spki_pin`]). The [`PinningValidator`]
//! runs inside the TLS handshake, so it never does I/O: pins are provisioned
//! ahead of time and swapped in whole.

use arc_swap::ArcSwap;
use base64::Engine;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audit;
use crate::config::HostPolicy;
use crate::error::PinningRejected;
use crate::tls;

/// Mapping from host to acceptable SPKI pins.
///
/// Keys are exact hosts or `*.suffix` wildcards, stored lowercased. An empty
/// pin list disables pinning for that host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct PinSet {
    hosts: BTreeMap<String, Vec<String>>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, replacing any pins already held for `host`.
    pub fn with_host<I, S>(mut self, host: &str, pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(host, pins);
        self
    }

    pub fn insert<I, S>(&mut self, host: &str, pins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pins: Vec<String> = pins.into_iter().map(Into::into).collect();
        pins.dedup();
        self.hosts.insert(host.to_lowercase(), pins);
    }

    /// Pins for `host`: exact entry first, then the longest matching wildcard.
    pub fn lookup(&self, host: &str) -> Option<&[String]> {
        let host = host.to_lowercase();
        if let Some(pins) = self.hosts.get(&host) {
            return Some(pins);
        }

        self.hosts
            .iter()
            .filter_map(|(pattern, pins)| {
                let suffix = pattern.strip_prefix('*')?;
                (host.ends_with(suffix) && host.len() > suffix.len()).then_some((suffix.len(), pins))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, pins)| pins.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.hosts.iter().map(|(h, p)| (h.as_str(), p.as_slice()))
    }

    fn merge(&mut self, other: PinSet) {
        self.hosts.extend(other.hosts);
    }
}

impl From<BTreeMap<String, Vec<String>>> for PinSet {
    fn from(map: BTreeMap<String, Vec<String>>) -> Self {
        let mut set = PinSet::new();
        for (host, pins) in map {
            set.insert(&host, pins);
        }
        set
    }
}

impl From<PinSet> for BTreeMap<String, Vec<String>> {
    fn from(set: PinSet) -> Self {
        set.hosts
    }
}

/// Whether `pin` is base64 of a 32-byte digest.
pub fn is_well_formed_pin(pin: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(pin)
        .map(|raw| raw.len() == 32)
        .unwrap_or(false)
}

/// Outcome of a pin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinDecision {
    Accept,
    Reject(PinningRejected),
}

impl PinDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, PinDecision::Accept)
    }

    pub fn into_result(self) -> Result<(), PinningRejected> {
        match self {
            PinDecision::Accept => Ok(()),
            PinDecision::Reject(rejected) => Err(rejected),
        }
    }
}

/// Validates presented certificate chains against the current pin set.
///
/// Reads are lock-free (`ArcSwap`); updates build a new set and swap it in, so
/// a validation sees either the old or the new set in full.
#[derive(Debug)]
pub struct PinningValidator {
    pins: ArcSwap<PinSet>,
    default_policy: HostPolicy,
}

impl PinningValidator {
    pub fn new(pins: PinSet, default_policy: HostPolicy) -> Self {
        Self {
            pins: ArcSwap::from_pointee(pins),
            default_policy,
        }
    }

    pub fn default_policy(&self) -> HostPolicy {
        self.default_policy
    }

    /// Snapshot of the pin set currently in force.
    pub fn pin_set(&self) -> Arc<PinSet> {
        self.pins.load_full()
    }

    /// Replace the pins of every host named in `update`, leaving others intact.
    pub fn update_pins(&self, update: PinSet) {
        let hosts = update.len();
        self.pins.rcu(|current| {
            let mut next = PinSet::clone(current);
            next.merge(update.clone());
            next
        });
        tracing::info!(hosts, "pin set updated");
    }

    /// Swap in an entirely new pin set.
    pub fn replace_all(&self, pins: PinSet) {
        let hosts = pins.len();
        self.pins.store(Arc::new(pins));
        tracing::info!(hosts, "pin set replaced");
    }

    /// Decide on a chain given the SPKI pins of its certificates.
    pub fn validate_hashes<S: AsRef<str>>(&self, host: &str, chain_pins: &[S]) -> PinDecision {
        let snapshot = self.pins.load();
        let decision = match snapshot.lookup(host) {
            None => match self.default_policy {
                HostPolicy::Allow => PinDecision::Accept,
                HostPolicy::Reject => PinDecision::Reject(PinningRejected {
                    host: host.to_string(),
                    reason: "host has no pins and unknown hosts are rejected".into(),
                }),
            },
            Some([]) => PinDecision::Accept,
            Some(pins) => {
                let matched = chain_pins
                    .iter()
                    .any(|presented| pins.iter().any(|p| p == presented.as_ref()));
                if matched {
                    PinDecision::Accept
                } else {
                    PinDecision::Reject(PinningRejected {
                        host: host.to_string(),
                        reason: format!(
                            "none of {} presented keys matched {} pins",
                            chain_pins.len(),
                            pins.len()
                        ),
                    })
                }
            }
        };

        audit::log_pinning(host, &decision);
        decision
    }

    /// Decide on a DER certificate chain (end entity first).
    ///
    /// Certificates whose key cannot be extracted contribute no pin.
    pub fn validate(&self, host: &str, chain: &[CertificateDer<'_>]) -> PinDecision {
        let presented: Vec<String> = chain
            .iter()
            .filter_map(|cert| tls::spki_pin(cert).ok())
            .collect();
        self.validate_hashes(host, &presented)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn validator(policy: HostPolicy) -> PinningValidator {
        let pins = PinSet::new().with_host("api.example.com", ["AAAA"]);
        PinningValidator::new(pins, policy)
    }

    #[test]
    fn test_matching_pin_accepted() {
        let v = validator(HostPolicy::Reject);
        assert!(v.validate_hashes("api.example.com", &["AAAA"]).is_accept());
    }

    #[test]
    fn test_non_matching_pin_rejected() {
        let v = validator(HostPolicy::Reject);
        let decision = v.validate_hashes("api.example.com", &["BBBB"]);
        assert!(matches!(decision, PinDecision::Reject(ref r) if r.host == "api.example.com"));
    }

    #[test]
    fn test_any_certificate_in_chain_may_match() {
        let v = validator(HostPolicy::Reject);
        assert!(v
            .validate_hashes("api.example.com", &["BBBB", "CCCC", "AAAA"])
            .is_accept());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let v = validator(HostPolicy::Allow);
        let empty: [&str; 0] = [];
        assert!(!v.validate_hashes("api.example.com", &empty).is_accept());
    }

    #[test]
    fn test_unknown_host_follows_default_policy() {
        assert!(!validator(HostPolicy::Reject)
            .validate_hashes("other.example.com", &["AAAA"])
            .is_accept());
        assert!(validator(HostPolicy::Allow)
            .validate_hashes("other.example.com", &["ZZZZ"])
            .is_accept());
    }

    #[test]
    fn test_empty_pin_list_disables_pinning() {
        let pins = PinSet::new().with_host("open.example.com", Vec::<String>::new());
        let v = PinningValidator::new(pins, HostPolicy::Reject);
        assert!(v.validate_hashes("open.example.com", &["anything"]).is_accept());
    }

    #[test]
    fn test_host_lookup_is_case_insensitive() {
        let v = validator(HostPolicy::Reject);
        assert!(v.validate_hashes("API.Example.COM", &["AAAA"]).is_accept());
    }

    #[test]
    fn test_wildcard_and_exact_precedence() {
        let pins = PinSet::new()
            .with_host("*.example.com", ["WILD"])
            .with_host("*.eu.example.com", ["EU"])
            .with_host("login.example.com", ["EXACT"]);
        assert_eq!(pins.lookup("cdn.example.com"), Some(&["WILD".to_string()][..]));
        assert_eq!(pins.lookup("a.eu.example.com"), Some(&["EU".to_string()][..]));
        assert_eq!(pins.lookup("login.example.com"), Some(&["EXACT".to_string()][..]));
        assert_eq!(pins.lookup("example.com"), None);
    }

    #[test]
    fn test_update_replaces_named_hosts_only() {
        let pins = PinSet::new()
            .with_host("a.example.com", ["A1"])
            .with_host("b.example.com", ["B1"]);
        let v = PinningValidator::new(pins, HostPolicy::Reject);

        v.update_pins(PinSet::new().with_host("a.example.com", ["A2"]));

        assert!(!v.validate_hashes("a.example.com", &["A1"]).is_accept());
        assert!(v.validate_hashes("a.example.com", &["A2"]).is_accept());
        assert!(v.validate_hashes("b.example.com", &["B1"]).is_accept());
    }

    #[test]
    fn test_replace_all_drops_missing_hosts() {
        let v = validator(HostPolicy::Reject);
        v.replace_all(PinSet::new().with_host("new.example.com", ["NEW"]));
        assert!(!v.validate_hashes("api.example.com", &["AAAA"]).is_accept());
        assert_eq!(v.pin_set().len(), 1);
    }

    #[test]
    fn test_update_is_never_observed_half_applied() {
        // Two hosts flip together; a reader must never see one old and one new.
        let old = PinSet::new()
            .with_host("a.example.com", ["OLD"])
            .with_host("b.example.com", ["OLD"]);
        let new = PinSet::new()
            .with_host("a.example.com", ["NEW"])
            .with_host("b.example.com", ["NEW"]);
        let v = Arc::new(PinningValidator::new(old.clone(), HostPolicy::Reject));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let v = Arc::clone(&v);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = v.pin_set();
                        assert_eq!(
                            snapshot.lookup("a.example.com"),
                            snapshot.lookup("b.example.com")
                        );
                    }
                })
            })
            .collect();

        for i in 0..500 {
            if i % 2 == 0 {
                v.update_pins(new.clone());
            } else {
                v.update_pins(old.clone());
            }
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_well_formed_pin() {
        assert!(is_well_formed_pin("47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="));
        assert!(!is_well_formed_pin("AAAA"));
        assert!(!is_well_formed_pin("not base64!"));
    }

    #[test]
    fn test_pin_set_deserializes_from_map() {
        let set: PinSet =
            serde_json::from_str(r#"{ "API.example.com": ["AAAA"], "*.cdn.net": [] }"#).unwrap();
        assert_eq!(set.lookup("api.example.com"), Some(&["AAAA".to_string()][..]));
        assert_eq!(set.lookup("img.cdn.net"), Some(&[][..]));
    }
}
