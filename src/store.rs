//! Token lifecycle: caching, single-flight fetching and retry.
//!
//! The store keeps one slot per binding (plus the unbound slot). Each slot
//! holds the latest token and a fetch state:
//!
//! ```text
//!   Idle ──get/prefetch──> InFlight ──success / retries exhausted──> Idle
//!                              └──────rejected / misconfigured──────> FailedPermanently
//!   FailedPermanently ──reset──> Idle
//! ```
//!
//! A fetch runs on its own tokio task, outside the slot lock. Callers that find
//! a fetch in flight subscribe to its `watch` channel and all resume with the
//! same outcome. Dropping a waiting caller only drops its receiver; the fetch
//! still completes and fills the cache.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::attestation::{AttestationClient, FetchRequest};
use crate::audit;
use crate::config::{AttestConfig, RetryPolicy};
use crate::error::AttestationError;
use crate::token::{Binding, Clock, SystemClock, Token};

type FetchOutcome = Result<Arc<Token>, AttestationError>;

/// Observable fetch state of a token slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    InFlight,
    FailedPermanently,
}

#[derive(Default)]
enum SlotState {
    #[default]
    Idle,
    InFlight(watch::Receiver<Option<FetchOutcome>>),
    FailedPermanently(AttestationError),
}

#[derive(Default)]
struct Slot {
    cached: Option<Arc<Token>>,
    state: SlotState,
}

struct Inner {
    client: Arc<dyn AttestationClient>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    expiry_margin: Duration,
    slots: Mutex<HashMap<Option<Binding>, Slot>>,
    attempts: AtomicU64,
}

/// Shared handle to the token cache. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("policy", &self.inner.policy)
            .field("expiry_margin", &self.inner.expiry_margin)
            .field("slots", &self.inner.slots.lock().len())
            .finish()
    }
}

impl TokenStore {
    pub fn new(client: Arc<dyn AttestationClient>, config: &AttestConfig) -> Self {
        Self::with_clock(client, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        client: Arc<dyn AttestationClient>,
        config: &AttestConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                clock,
                policy: config.retry_policy(),
                expiry_margin: config.expiry_margin,
                slots: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Token for the unbound slot.
    ///
    /// Served from cache when a usable token exists and `force_refresh` is
    /// false; otherwise joins the in-flight fetch or starts one.
    pub async fn get_token(&self, force_refresh: bool) -> FetchOutcome {
        self.get_slot_token(None, force_refresh).await
    }

    /// Token whose claim is bound to `binding`.
    pub async fn get_bound_token(&self, binding: &Binding, force_refresh: bool) -> FetchOutcome {
        self.get_slot_token(Some(binding.clone()), force_refresh).await
    }

    async fn get_slot_token(&self, key: Option<Binding>, force_refresh: bool) -> FetchOutcome {
        let rx = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.clone()).or_default();

            if !force_refresh {
                if let Some(token) = slot.cached.as_ref().filter(|t| self.is_usable(t)) {
                    debug!(bound = key.is_some(), "serving cached attestation token");
                    return Ok(Arc::clone(token));
                }
            }

            let joinable = match &slot.state {
                SlotState::FailedPermanently(e) => return Err(e.clone()),
                SlotState::InFlight(rx) if !is_abandoned(rx) => Some(rx.clone()),
                _ => None,
            };
            match joinable {
                Some(rx) => rx,
                None => self.start_fetch(slot, key)?,
            }
        };

        wait_for_outcome(rx).await
    }

    /// Start a fetch for the unbound slot without waiting for it.
    ///
    /// Returns false when a usable token is cached, a fetch is already running,
    /// or the slot has failed permanently.
    pub fn prefetch(&self) -> bool {
        let mut slots = self.inner.slots.lock();
        let slot = slots.entry(None).or_default();

        if slot.cached.as_ref().is_some_and(|t| self.is_usable(t)) {
            return false;
        }
        let startable = match &slot.state {
            SlotState::Idle => true,
            SlotState::InFlight(rx) => is_abandoned(rx),
            SlotState::FailedPermanently(_) => false,
        };
        startable && self.start_fetch(slot, None).is_ok()
    }

    /// Drop every cached token and clear permanent failures.
    ///
    /// Fetches already in flight are left to finish. Bound slots with no
    /// fetch running are removed outright.
    pub fn reset(&self) {
        let mut slots = self.inner.slots.lock();
        slots.retain(|key, slot| key.is_none() || matches!(slot.state, SlotState::InFlight(_)));
        for slot in slots.values_mut() {
            slot.cached = None;
            if matches!(slot.state, SlotState::FailedPermanently(_)) {
                slot.state = SlotState::Idle;
            }
        }
        tracing::info!("attestation token store reset");
    }

    /// Current fetch state of the slot for `binding` (`None` = unbound).
    pub fn fetch_state(&self, binding: Option<&Binding>) -> FetchState {
        let slots = self.inner.slots.lock();
        match slots.get(&binding.cloned()).map(|s| &s.state) {
            None | Some(SlotState::Idle) => FetchState::Idle,
            Some(SlotState::InFlight(rx)) if is_abandoned(rx) => FetchState::Idle,
            Some(SlotState::InFlight(_)) => FetchState::InFlight,
            Some(SlotState::FailedPermanently(_)) => FetchState::FailedPermanently,
        }
    }

    /// Number of slots currently held, the unbound slot included.
    pub fn slot_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Remote fetch attempts made so far, retries included.
    pub fn fetch_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Whether `token` may be attached right now.
    pub fn is_usable(&self, token: &Token) -> bool {
        token.is_usable_at(self.inner.clock.now(), self.inner.expiry_margin)
    }

    fn start_fetch(
        &self,
        slot: &mut Slot,
        key: Option<Binding>,
    ) -> Result<watch::Receiver<Option<FetchOutcome>>, AttestationError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AttestationError::Config("token fetch requires a tokio runtime".into())
        })?;

        let (tx, rx) = watch::channel(None);
        slot.state = SlotState::InFlight(rx.clone());

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move { inner.run_fetch(key, tx).await });

        Ok(rx)
    }
}

impl Inner {
    async fn run_fetch(&self, key: Option<Binding>, tx: watch::Sender<Option<FetchOutcome>>) {
        let request = match &key {
            Some(binding) => FetchRequest::bound(binding),
            None => FetchRequest::unbound(),
        };

        let outcome = self
            .fetch_with_retries(&request)
            .await
            .map(|token| Arc::new(token.with_binding(key.clone())));

        audit::log_fetch(key.is_some(), &outcome);

        let mut slots = self.slots.lock();
        let slot = slots.entry(key).or_default();
        match &outcome {
            Ok(token) => {
                slot.cached = Some(Arc::clone(token));
                slot.state = SlotState::Idle;
            }
            Err(e) if e.is_retryable() => slot.state = SlotState::Idle,
            Err(e) => {
                slot.cached = None;
                slot.state = SlotState::FailedPermanently(e.clone());
            }
        }
        self.evict_idle_bound(&mut slots);
        tx.send_replace(Some(outcome));
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<Token, AttestationError> {
        let mut attempt = 0u32;
        loop {
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let result = match tokio::time::timeout(
                self.policy.fetch_timeout,
                self.client.fetch(request),
            )
            .await
            {
                Ok(result) => result.and_then(|token| self.check_fresh(token)),
                Err(_) => Err(AttestationError::Network(format!(
                    "attestation fetch timed out after {:?}",
                    self.policy.fetch_timeout
                ))),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    audit::log_fetch_retry(attempt, delay, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Bound slots come and go with binding values; drop the ones that hold
    /// nothing worth keeping.
    fn evict_idle_bound(&self, slots: &mut HashMap<Option<Binding>, Slot>) {
        let now = self.clock.now();
        let before = slots.len();
        slots.retain(|key, slot| {
            key.is_none()
                || match &slot.state {
                    SlotState::InFlight(rx) => !is_abandoned(rx),
                    SlotState::FailedPermanently(_) => true,
                    SlotState::Idle => slot
                        .cached
                        .as_ref()
                        .is_some_and(|t| t.is_usable_at(now, self.expiry_margin)),
                }
        });
        if slots.len() < before {
            debug!(evicted = before - slots.len(), "evicted idle bound token slots");
        }
    }

    fn check_fresh(&self, token: Token) -> Result<Token, AttestationError> {
        if !token.is_valid() {
            return Err(AttestationError::Rejected(
                "attestation service issued a token flagged invalid".into(),
            ));
        }
        if !token.is_usable_at(self.clock.now(), self.expiry_margin) {
            return Err(AttestationError::Network(
                "attestation service issued an already expired token".into(),
            ));
        }
        Ok(token)
    }
}

/// The fetch task went away without publishing (it panicked).
fn is_abandoned(rx: &watch::Receiver<Option<FetchOutcome>>) -> bool {
    rx.has_changed().is_err() && rx.borrow().is_none()
}

async fn wait_for_outcome(mut rx: watch::Receiver<Option<FetchOutcome>>) -> FetchOutcome {
    let abandoned = || Err(AttestationError::Network("attestation fetch abandoned".into()));
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or_else(abandoned),
        Err(_) => abandoned(),
    }
}
