//! SPKI pin computation and handshake-time pin enforcement.
//!
//! Pins are computed by hashing the full SPKI (SubjectPublicKeyInfo) DER
//! encoding, not just the raw public key bytes, and encoding the SHA-256
//! digest as standard base64.
//!
//! Every rustls config built here names the aws-lc-rs provider explicitly.
//! Both rustls backends end up enabled in the dependency graph, so the
//! process-level default cannot be inferred.

use base64::Engine;
use der::Encode;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, PinningRejected, Result};
use crate::pinning::PinningValidator;

/// The crypto provider used for every handshake.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Compute the base64 SHA-256 pin of a certificate's public key.
pub fn spki_pin(cert_der: &CertificateDer<'_>) -> Result<String> {
    use der::Decode;
    use x509_cert::Certificate;

    let cert = Certificate::from_der(cert_der.as_ref())
        .map_err(|e| Error::Tls(format!("Failed to parse certificate: {}", e)))?;

    // algorithm identifier + public key bits
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Tls(format!("Failed to encode SPKI: {}", e)))?;

    let hash = Sha256::digest(&spki_der);

    Ok(base64::engine::general_purpose::STANDARD.encode(hash))
}

fn host_of(server_name: &ServerName<'_>) -> String {
    match server_name {
        ServerName::DnsName(name) => name.as_ref().to_lowercase(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        other => format!("{:?}", other),
    }
}

/// Recover the pin rejection behind a failed connection, if there is one.
///
/// Follows `source()` links, and also looks inside `io::Error` payloads and
/// `rustls::Error::Other`, which hide their wrapped error from `source()`.
pub fn find_pinning_rejection(
    err: &(dyn std::error::Error + 'static),
) -> Option<PinningRejected> {
    if let Some(rejected) = err.downcast_ref::<PinningRejected>() {
        return Some(rejected.clone());
    }
    if let Some(rustls::Error::Other(other)) = err.downcast_ref::<rustls::Error>() {
        if let Some(found) = find_pinning_rejection(&*other.0) {
            return Some(found);
        }
    }
    if let Some(inner) = err
        .downcast_ref::<std::io::Error>()
        .and_then(std::io::Error::get_ref)
    {
        if let Some(found) = find_pinning_rejection(inner) {
            return Some(found);
        }
    }
    err.source().and_then(find_pinning_rejection)
}

/// Certificate verifier that enforces the dynamic pin set on every handshake.
///
/// This verifier:
/// 1. First validates the certificate chain normally (CA signatures, expiry, etc.)
/// 2. Then asks the [`PinningValidator`] whether any certificate in the chain
///    carries a pinned key for the server name.
///
/// A rejection surfaces as `rustls::Error::Other` wrapping [`PinningRejected`].
#[derive(Debug)]
pub struct PinnedCertVerifier {
    validator: Arc<PinningValidator>,
    /// Standard certificate verifier for chain validation.
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

impl PinnedCertVerifier {
    /// Create a verifier backed by the bundled web PKI roots.
    pub fn new(validator: Arc<PinningValidator>) -> Result<Self> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self::with_roots(validator, root_store)
    }

    /// Create a verifier trusting a caller-supplied root store.
    pub fn with_roots(
        validator: Arc<PinningValidator>,
        roots: rustls::RootCertStore,
    ) -> Result<Self> {
        let inner = rustls::client::WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            crypto_provider(),
        )
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build verifier: {}", e)))?;

        Ok(Self { validator, inner })
    }

    pub fn validator(&self) -> &Arc<PinningValidator> {
        &self.validator
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )?;

        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        self.validator
            .validate(&host_of(server_name), &chain)
            .into_result()
            .map_err(|rejected| rustls::Error::Other(rustls::OtherError(Arc::new(rejected))))?;

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// rustls client config whose handshakes go through the pin set.
pub fn pinned_client_config(verifier: Arc<PinnedCertVerifier>) -> Result<rustls::ClientConfig> {
    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to select protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

/// Create a reqwest client with certificate pinning.
///
/// Any connection whose chain carries no pinned key for its host is aborted
/// during the handshake, regardless of attestation fail policy. Redirects are
/// not followed: the attestation header was scoped to the original host, so
/// the 3xx goes back to the caller.
pub fn create_pinned_client(verifier: Arc<PinnedCertVerifier>) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_preconfigured_tls(pinned_client_config(verifier)?)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

/// Connect to `host:port`, validate the chain against `roots` and report the
/// SPKI pin of every certificate the server presents.
///
/// Meant for provisioning pin sets out of band, never from inside a handshake.
pub async fn fetch_peer_pins(
    host: &str,
    port: u16,
    roots: rustls::RootCertStore,
) -> Result<Vec<String>> {
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    let addr = format!("{}:{}", host, port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::Tls(format!("Failed to connect: {}", e)))?;

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to select protocol versions: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name: ServerName<'static> = host
        .to_string()
        .try_into()
        .map_err(|_| Error::Tls("Invalid server name".into()))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))?;

    let (_, conn) = tls_stream.get_ref();
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| Error::Tls("No peer certificates".into()))?;

    if certs.is_empty() {
        return Err(Error::Tls("Empty certificate chain".into()));
    }

    certs.iter().map(spki_pin).collect()
}
