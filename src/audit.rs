//! Audit logging for attestation, interception and pinning decisions.
//!
//! Emits structured events via `tracing` under the `attested_session::audit`
//! target. Token values, bind-header values and request bodies are never
//! included.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AttestationError;
use crate::pinning::PinDecision;
use crate::request::AttestationStatus;
use crate::token::Token;

/// Log the final outcome of a fetch chain.
pub fn log_fetch(bound: bool, outcome: &Result<Arc<Token>, AttestationError>) {
    match outcome {
        Ok(_) => info!(
            target: "attested_session::audit",
            bound = bound,
            decision = "issued",
            "attestation token fetched"
        ),
        Err(e) => warn!(
            target: "attested_session::audit",
            bound = bound,
            decision = "failed",
            reason = %e,
            retryable = e.is_retryable(),
            "attestation token fetch failed"
        ),
    }
}

/// Log a transient failure that will be retried.
pub fn log_fetch_retry(attempt: u32, delay: Duration, error: &AttestationError) {
    info!(
        target: "attested_session::audit",
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        reason = %error,
        "retrying attestation fetch"
    );
}

/// Log how a request left the interceptor.
pub fn log_interception(host: &str, status: AttestationStatus, reason: Option<&str>) {
    match status {
        AttestationStatus::FailedOpen => warn!(
            target: "attested_session::audit",
            host = host,
            decision = %status,
            reason = reason.unwrap_or(""),
            "request dispatched without attestation"
        ),
        _ => info!(
            target: "attested_session::audit",
            host = host,
            decision = %status,
            "request intercepted"
        ),
    }
}

/// Log a request aborted by fail-closed policy.
pub fn log_aborted(host: &str, reason: &str) {
    warn!(
        target: "attested_session::audit",
        host = host,
        decision = "abort",
        reason = reason,
        "request aborted"
    );
}

/// Log a handshake pin decision. Accepts are debug-level; rejections always warn.
pub fn log_pinning(host: &str, decision: &PinDecision) {
    match decision {
        PinDecision::Accept => tracing::debug!(
            target: "attested_session::audit",
            host = host,
            decision = "accept",
            "pin check passed"
        ),
        PinDecision::Reject(rejected) => warn!(
            target: "attested_session::audit",
            host = host,
            decision = "reject",
            reason = %rejected.reason,
            "pin check failed"
        ),
    }
}

/// Log a task created through a path that carries no attestation.
pub fn log_unprotected(kind: &str) {
    warn!(
        target: "attested_session::audit",
        kind = kind,
        decision = "unprotected",
        "task created without attestation"
    );
}
