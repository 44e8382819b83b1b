//! Per-request attestation.
//!
//! For each outbound request the interceptor decides whether the host is in
//! scope, resolves a token (bound to the configured bind header's value when
//! present), attaches it and hands the pinning validator along with the
//! rewritten request. When no token can be had, the fail policy decides
//! between aborting and forwarding the request untouched.

use arc_swap::ArcSwapOption;
use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::audit;
use crate::config::{parse_header_name, AttestConfig, FailPolicy};
use crate::error::{AttestationError, InterceptionError, Result};
use crate::pinning::PinningValidator;
use crate::request::{AttestationStatus, InterceptedRequest, RequestDescriptor};
use crate::store::TokenStore;
use crate::token::{Binding, Token};

/// Name of the header whose value is bound into attestation claims.
///
/// Shared by every request; a change applies to requests intercepted after it.
#[derive(Debug, Default)]
pub struct BindHeader {
    current: ArcSwapOption<HeaderName>,
}

impl BindHeader {
    pub fn new(name: Option<HeaderName>) -> Self {
        Self {
            current: ArcSwapOption::from(name.map(Arc::new)),
        }
    }

    /// Set or clear the bind header.
    pub fn set(&self, name: Option<&str>) -> Result<()> {
        let parsed = name.map(parse_header_name).transpose()?;
        self.current.store(parsed.map(Arc::new));
        Ok(())
    }

    pub fn get(&self) -> Option<HeaderName> {
        self.current.load_full().map(|name| HeaderName::clone(&name))
    }
}

/// Exact hosts plus `*.suffix` patterns, matched case-insensitively.
#[derive(Debug, Clone, Default)]
struct HostMatcher {
    exact: Vec<String>,
    suffixes: Vec<String>,
}

impl HostMatcher {
    fn new<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut matcher = Self::default();
        for host in hosts {
            let lower = host.to_lowercase();
            if let Some(suffix) = lower.strip_prefix('*') {
                matcher.suffixes.push(suffix.to_string());
            } else {
                matcher.exact.push(lower);
            }
        }
        matcher
    }

    fn matches(&self, host: &str) -> bool {
        self.exact.iter().any(|h| h == host)
            || self
                .suffixes
                .iter()
                .any(|s| host.ends_with(s.as_str()) && host.len() > s.len())
    }
}

/// Attaches attestation tokens to outbound requests.
#[derive(Debug)]
pub struct RequestInterceptor {
    store: TokenStore,
    pinning: Arc<PinningValidator>,
    bind_header: Arc<BindHeader>,
    token_header: HeaderName,
    token_prefix: String,
    fail_policy: FailPolicy,
    excluded: HostMatcher,
}

impl RequestInterceptor {
    pub fn new(
        config: &AttestConfig,
        store: TokenStore,
        pinning: Arc<PinningValidator>,
    ) -> Result<Self> {
        let bind_header = config
            .bind_header_name
            .as_deref()
            .map(parse_header_name)
            .transpose()?;

        let attestation_host = config.attestation_host();
        let excluded = HostMatcher::new(
            config
                .excluded_hosts
                .iter()
                .map(String::as_str)
                .chain(attestation_host.as_deref()),
        );

        Ok(Self {
            store,
            pinning,
            bind_header: Arc::new(BindHeader::new(bind_header)),
            token_header: parse_header_name(&config.token_header)?,
            token_prefix: config.token_prefix.clone(),
            fail_policy: config.fail_policy,
            excluded,
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn pinning(&self) -> &Arc<PinningValidator> {
        &self.pinning
    }

    pub fn bind_header(&self) -> &Arc<BindHeader> {
        &self.bind_header
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Whether requests to `host` skip attestation entirely.
    pub fn is_excluded(&self, host: &str) -> bool {
        self.excluded.matches(&host.to_lowercase())
    }

    /// Attest `request` for dispatch.
    ///
    /// The returned working copy differs from the input by at most the
    /// attestation header. Intercepting an already attested request again
    /// leaves it as is.
    pub async fn intercept(
        &self,
        request: RequestDescriptor,
    ) -> std::result::Result<InterceptedRequest, InterceptionError> {
        let host = request
            .host()
            .ok_or_else(|| InterceptionError::NoHost(request.url.to_string()))?;

        if self.excluded.matches(&host) {
            audit::log_interception(&host, AttestationStatus::Excluded, None);
            return Ok(self.untouched(request, AttestationStatus::Excluded));
        }

        let binding = self.binding_for(&request);
        let attached = self
            .resolve_token(binding.as_ref())
            .await
            .and_then(|token| self.attach(&request, &token));

        match attached {
            Ok(working) => {
                audit::log_interception(&host, AttestationStatus::Attested, None);
                Ok(InterceptedRequest::new(
                    request,
                    working,
                    AttestationStatus::Attested,
                    Arc::clone(&self.pinning),
                ))
            }
            Err(e) => match self.fail_policy {
                FailPolicy::Closed => {
                    audit::log_aborted(&host, &e.to_string());
                    Err(InterceptionError::Attestation(e))
                }
                FailPolicy::Open => {
                    audit::log_interception(
                        &host,
                        AttestationStatus::FailedOpen,
                        Some(&e.to_string()),
                    );
                    Ok(self.untouched(request, AttestationStatus::FailedOpen))
                }
            },
        }
    }

    /// Force a new token after the server rejected the one `request` carried.
    pub async fn refresh_after_rejection(
        &self,
        request: &RequestDescriptor,
    ) -> std::result::Result<(), AttestationError> {
        let binding = self.binding_for(request);
        self.fetch(binding.as_ref(), true).await.map(|_| ())
    }

    /// Warm the unbound token slot without waiting.
    pub fn prefetch(&self) -> bool {
        self.store.prefetch()
    }

    fn untouched(&self, request: RequestDescriptor, status: AttestationStatus) -> InterceptedRequest {
        InterceptedRequest::new(request.clone(), request, status, Arc::clone(&self.pinning))
    }

    fn binding_for(&self, request: &RequestDescriptor) -> Option<Binding> {
        let name = self.bind_header.get()?;
        match request.headers.get(&name) {
            Some(value) => Some(Binding::from_value(value.as_bytes())),
            None => {
                debug!(header = %name, "bind header absent, attesting unbound");
                None
            }
        }
    }

    async fn fetch(
        &self,
        binding: Option<&Binding>,
        force_refresh: bool,
    ) -> std::result::Result<Arc<Token>, AttestationError> {
        match binding {
            Some(b) => self.store.get_bound_token(b, force_refresh).await,
            None => self.store.get_token(force_refresh).await,
        }
    }

    /// A token that is usable at dispatch time, refreshing once if the
    /// cached one lapsed on the way here.
    async fn resolve_token(
        &self,
        binding: Option<&Binding>,
    ) -> std::result::Result<Arc<Token>, AttestationError> {
        let token = self.fetch(binding, false).await?;
        if self.store.is_usable(&token) {
            return Ok(token);
        }

        let token = self.fetch(binding, true).await?;
        if self.store.is_usable(&token) {
            Ok(token)
        } else {
            Err(AttestationError::Network(
                "attestation token expired before dispatch".into(),
            ))
        }
    }

    fn attach(
        &self,
        request: &RequestDescriptor,
        token: &Token,
    ) -> std::result::Result<RequestDescriptor, AttestationError> {
        let already_attached = request
            .headers
            .get(&self.token_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix(self.token_prefix.as_str()))
            .is_some_and(|attached| token.matches(attached));
        if already_attached {
            return Ok(request.clone());
        }

        let value = Zeroizing::new(format!("{}{}", self.token_prefix, token.as_str()));

        let mut header = HeaderValue::from_str(&value).map_err(|_| {
            AttestationError::Config("attestation token is not a valid header value".into())
        })?;
        header.set_sensitive(true);

        let mut working = request.clone();
        working.headers.insert(self.token_header.clone(), header);
        Ok(working)
    }
}
