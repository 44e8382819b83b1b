//! Request descriptors passed across the transport boundary.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pinning::PinningValidator;

/// An outbound request as the application built it.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// GET request for `url`, as the URL-only task constructors build it.
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid url '{}': {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Config(format!("invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Config(format!("invalid value for header '{}'", name)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Target host, lowercased.
    pub fn host(&self) -> Option<String> {
        self.url.host_str().map(str::to_lowercase)
    }

    /// Build the reqwest equivalent on `client`.
    pub fn to_reqwest(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        match &self.body {
            Some(body) => builder.body(body.clone()),
            None => builder,
        }
    }
}

/// How the interceptor treated a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationStatus {
    /// Carries a current attestation token.
    Attested,
    /// Host is out of scope; forwarded untouched.
    Excluded,
    /// No token could be obtained and fail-open let it through untouched.
    FailedOpen,
}

impl fmt::Display for AttestationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttestationStatus::Attested => write!(f, "attested"),
            AttestationStatus::Excluded => write!(f, "excluded"),
            AttestationStatus::FailedOpen => write!(f, "failed_open"),
        }
    }
}

/// The original request next to the working copy that will be dispatched.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    original: RequestDescriptor,
    request: RequestDescriptor,
    status: AttestationStatus,
    pinning: Arc<PinningValidator>,
}

impl InterceptedRequest {
    pub(crate) fn new(
        original: RequestDescriptor,
        request: RequestDescriptor,
        status: AttestationStatus,
        pinning: Arc<PinningValidator>,
    ) -> Self {
        Self {
            original,
            request,
            status,
            pinning,
        }
    }

    /// The request exactly as the application supplied it.
    pub fn original(&self) -> &RequestDescriptor {
        &self.original
    }

    /// The request to dispatch.
    pub fn request(&self) -> &RequestDescriptor {
        &self.request
    }

    pub fn status(&self) -> AttestationStatus {
        self.status
    }

    /// Validator the connection's handshake must consult.
    pub fn pinning(&self) -> &Arc<PinningValidator> {
        &self.pinning
    }

    /// Whether the working copy differs from the original.
    pub fn is_modified(&self) -> bool {
        self.original.headers != self.request.headers
    }

    pub fn into_request(self) -> RequestDescriptor {
        self.request
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_descriptor() {
        let req = RequestDescriptor::get("https://API.example.com/v1/items").unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.host().as_deref(), Some("api.example.com"));
        assert!(req.body.is_none());
    }

    #[test]
    fn test_invalid_url() {
        assert!(RequestDescriptor::get("::nope").is_err());
    }

    #[test]
    fn test_with_header_appends() {
        let req = RequestDescriptor::get("https://api.example.com/")
            .unwrap()
            .with_header("Accept", "text/plain")
            .unwrap()
            .with_header("Accept", "application/json")
            .unwrap();
        assert_eq!(req.headers.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_to_reqwest_preserves_request() {
        let req = RequestDescriptor::new(
            Method::POST,
            Url::parse("https://api.example.com/upload").unwrap(),
        )
        .with_header("X-Trace", "1")
        .unwrap()
        .with_body("payload");

        let built = req.to_reqwest(&reqwest::Client::new()).build().unwrap();
        assert_eq!(built.method(), Method::POST);
        assert_eq!(built.url().as_str(), "https://api.example.com/upload");
        assert_eq!(built.headers().get("x-trace").unwrap(), "1");
        assert_eq!(built.body().unwrap().as_bytes(), Some(&b"payload"[..]));
    }
}
