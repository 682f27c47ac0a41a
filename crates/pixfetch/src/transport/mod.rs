//! # Transport
//!
//! The HTTP seam used by fetch operations. A transport issues a single GET and
//! hands back the response head together with a stream of body chunks; the
//! operation owns everything above that (validation, buffering, decoding).

mod error;
pub mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;
use url::Url;

pub use error::{TransportError, TransportErrorKind};
pub use http::HttpTransport;

/// Scheduling hint forwarded to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Credentials used to answer an authentication challenge.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A fully resolved request for one resource.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub priority: RequestPriority,
    /// Send and store cookies for this request.
    pub handle_cookies: bool,
    /// Skip server certificate validation.
    pub allow_invalid_certificates: bool,
    /// Allow the transport to revalidate against its own response cache.
    pub use_protocol_cache: bool,
    pub credentials: Option<Credentials>,
}

impl TransportRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(15),
            priority: RequestPriority::Normal,
            handle_cookies: false,
            allow_invalid_certificates: false,
            use_protocol_cache: false,
            credentials: None,
        }
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// Declared body length, when the server sent one.
    pub expected_length: Option<u64>,
    pub body: BodyStream,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("expected_length", &self.expected_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return once response headers are available.
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Body the transport already holds for this request, if any.
    async fn cached_response(&self, request: &TransportRequest) -> Option<Bytes>;
}
