#![allow(dead_code)]

use async_trait::async_trait;
use attested_session::{AttestationClient, AttestationError, FetchRequest, Token};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Issues `tok-<n>` tokens valid for `ttl`, or fails with `failure` when set.
pub struct FakeAttestation {
    calls: AtomicUsize,
    delay: Duration,
    ttl: Duration,
    failure: Mutex<Option<AttestationError>>,
    pub requests: Mutex<Vec<FetchRequest>>,
}

impl FakeAttestation {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            ttl: Duration::from_secs(300),
            failure: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: AttestationError) -> Arc<Self> {
        let fake = Self::new(Duration::ZERO);
        fake.fail_with(Some(error));
        fake
    }

    pub fn fail_with(&self, error: Option<AttestationError>) {
        *self.failure.lock() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationClient for FakeAttestation {
    async fn fetch(&self, request: &FetchRequest) -> Result<Token, AttestationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(Token::new(format!("tok-{}", n), SystemTime::now() + self.ttl))
    }
}
