//! Scripted attestation client for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::{AttestationClient, FetchRequest};
use crate::error::AttestationError;
use crate::token::{Clock, ManualClock, Token};

type Respond = dyn Fn(usize, &FetchRequest) -> Result<Token, AttestationError> + Send + Sync;

/// Answers each fetch with `respond(call_index, request)` after `delay`.
pub(crate) struct ScriptedClient {
    calls: AtomicUsize,
    delay: Duration,
    pub(crate) seen: Mutex<Vec<FetchRequest>>,
    respond: Box<Respond>,
}

impl ScriptedClient {
    pub(crate) fn new(
        delay: Duration,
        respond: impl Fn(usize, &FetchRequest) -> Result<Token, AttestationError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            seen: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationClient for ScriptedClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<Token, AttestationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        tokio::time::sleep(self.delay).await;
        (self.respond)(n, request)
    }
}

pub(crate) fn start() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000)
}

/// Issues `token-<n>` valid for 60s of `clock` time.
pub(crate) fn issuing(
    clock: &ManualClock,
) -> impl Fn(usize, &FetchRequest) -> Result<Token, AttestationError> {
    let clock = clock.clone();
    move |n, _| {
        Ok(Token::new(
            format!("token-{}", n),
            clock.now() + Duration::from_secs(60),
        ))
    }
}
