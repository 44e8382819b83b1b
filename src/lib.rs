//! # Attested Session
//!
//! Transparent request attestation and TLS certificate pinning for outbound
//! HTTP(S).
//!
//! ## Attestation tokens
//!
//! A [`TokenStore`] caches short-lived tokens issued by a remote attestation
//! service. Concurrent requests that need a token share a single fetch; its
//! outcome (token or classified failure) is delivered to every waiter. Transient
//! failures are retried with backoff, while rejections and misconfiguration
//! stick until the store is reset.
//!
//! Tokens can be bound to the value of a request header (for example an
//! existing `Authorization` header) so neither credential can be replayed on
//! its own.
//!
//! ## Interception
//!
//! Every task created through a [`SessionFacade`] passes through the
//! [`RequestInterceptor`], which attaches the token header to in-scope requests.
//! When no token can be obtained the configured [`FailPolicy`] either aborts
//! the request or lets it through untouched.
//!
//! ## TLS Certificate Pinning
//!
//! The [`PinningValidator`] holds a per-host set of SPKI pins that can be
//! updated at runtime. Handshakes go through [`tls::PinnedCertVerifier`], which
//! runs standard chain validation first and then requires a pinned key
//! somewhere in the presented chain. A pin mismatch always aborts the
//! connection, whatever the fail policy says.
//!
//! ## Example
//!
//! ```rust,ignore
//! use attested_session::{AttestConfig, AttestedSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AttestConfig::from_file("attest.json")?;
//!     let session = AttestedSession::builder(config).build()?;
//!     session.prefetch();
//!
//!     let task = session
//!         .data_task_with_url(
//!             "https://api.example.com/items",
//!             Some(Box::new(|result| println!("{:?}", result.map(|r| r.status)))),
//!         )
//!         .await?;
//!     println!("started task {}", task.id());
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod audit;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod pinning;
pub mod request;
pub mod session;
pub mod store;
pub mod tls;
pub mod token;

pub use attestation::{AttestationClient, FetchRequest, HttpAttestationClient};
pub use config::{AttestConfig, FailPolicy, HostPolicy, RetryPolicy};
pub use error::{AttestationError, Error, InterceptionError, PinningRejected, Result, TransportError};
pub use interceptor::{BindHeader, RequestInterceptor};
pub use pinning::{PinDecision, PinSet, PinningValidator};
pub use request::{AttestationStatus, InterceptedRequest, RequestDescriptor};
pub use session::{
    AttestedSession, ReqwestTransport, SessionBuilder, SessionFacade, TaskBody, TaskHandle,
    TaskKind, TaskResponse, Transport,
};
pub use store::{FetchState, TokenStore};
pub use token::{Binding, Clock, ManualClock, SystemClock, Token};
