//! # HTTP Transport
//!
//! [`Transport`] backed by `reqwest`. Clients are built lazily, one per
//! cookie/certificate combination, and reused for every later request with the
//! same flags. Successful bodies are remembered in a small response cache that
//! backs conditional requests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use super::{
    BodyStream, Credentials, Transport, TransportError, TransportErrorKind, TransportRequest,
    TransportResponse,
};
use crate::cache::{CacheCost, MemoryCache, extract_cache_headers};
use crate::config::DownloaderConfig;

/// Upper bound for remembered response bodies.
const RESPONSE_CACHE_SIZE: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionFlags {
    cookies: bool,
    invalid_certs: bool,
}

impl SessionFlags {
    fn for_request(request: &TransportRequest) -> Self {
        Self {
            cookies: request.handle_cookies,
            invalid_certs: request.allow_invalid_certificates,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    body: Bytes,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl CacheCost for CachedResponse {
    fn cost(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(
    config: &DownloaderConfig,
    handle_cookies: bool,
    accept_invalid_certs: bool,
) -> Result<Client, TransportError> {
    let mut client_builder = Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .cookie_store(handle_cookies)
        .danger_accept_invalid_certs(accept_invalid_certs || config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.pool_idle_timeout.is_zero() {
        client_builder = client_builder.pool_idle_timeout(config.pool_idle_timeout);
    }

    // Set up proxy configuration
    if let Some(proxy_config) = &config.proxy {
        // Explicit proxy configuration takes precedence
        client_builder = client_builder.proxy(proxy_config.to_reqwest()?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for downloads");
    } else if config.use_system_proxy {
        // reqwest will use system proxy settings by default when we don't call no_proxy()
        info!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder.build().map_err(TransportError::from)
}

pub struct HttpTransport {
    config: DownloaderConfig,
    clients: Mutex<HashMap<SessionFlags, Client>>,
    responses: MemoryCache<CachedResponse>,
}

impl HttpTransport {
    pub fn new(config: DownloaderConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            responses: MemoryCache::new(RESPONSE_CACHE_SIZE, None),
        }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    fn client(&self, flags: SessionFlags) -> Result<Client, TransportError> {
        if let Some(client) = self.clients.lock().get(&flags) {
            return Ok(client.clone());
        }

        let client = create_client(&self.config, flags.cookies, flags.invalid_certs)?;
        Ok(self.clients.lock().entry(flags).or_insert(client).clone())
    }

    async fn execute(
        &self,
        client: &Client,
        request: &TransportRequest,
        headers: HeaderMap,
        credentials: Option<&Credentials>,
    ) -> Result<reqwest::Response, TransportError> {
        let mut builder = client.get(request.url.clone()).headers(headers);
        if !request.timeout.is_zero() {
            builder = builder.timeout(request.timeout);
        }
        if let Some(credentials) = credentials {
            builder = builder.basic_auth(&credentials.username, credentials.password.as_ref());
        }
        builder.send().await.map_err(TransportError::from)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(SessionFlags::for_request(request))?;
        let key = request.url.as_str();

        let cached = if request.use_protocol_cache {
            self.responses.get(key)
        } else {
            None
        };

        let mut headers = request.headers.clone();
        if let Some(cached) = &cached {
            apply_validators(&mut headers, cached);
        }

        debug!(url = %request.url, priority = ?request.priority, "Sending image request");
        let mut response = self
            .execute(&client, request, headers.clone(), None)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(credentials) = &request.credentials {
                debug!(url = %request.url, "Answering authentication challenge");
                response = self
                    .execute(&client, request, headers, Some(credentials))
                    .await?;
            }
        }

        let status = response.status();
        let response_headers = response.headers().clone();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(cached) = cached {
                debug!(url = %request.url, "Serving revalidated response from cache");
                return Ok(TransportResponse {
                    status: status.as_u16(),
                    headers: response_headers,
                    expected_length: Some(cached.body.len() as u64),
                    body: stream::iter([Ok::<_, TransportError>(cached.body)]).boxed(),
                });
            }
        }

        let expected_length = response.content_length();
        let body = response.bytes_stream().map_err(TransportError::from).boxed();
        let body = if status == StatusCode::OK {
            let (etag, last_modified, _) = extract_cache_headers(&response_headers);
            record_body(
                body,
                self.responses.clone(),
                key.to_string(),
                etag,
                last_modified,
            )
        } else {
            body
        };

        Ok(TransportResponse {
            status: status.as_u16(),
            headers: response_headers,
            expected_length,
            body,
        })
    }

    async fn cached_response(&self, request: &TransportRequest) -> Option<Bytes> {
        self.responses
            .get(request.url.as_str())
            .map(|cached| cached.body)
    }
}

fn apply_validators(headers: &mut HeaderMap, cached: &CachedResponse) {
    if let Some(value) = cached
        .etag
        .as_deref()
        .and_then(|etag| HeaderValue::from_str(etag).ok())
    {
        headers.insert(IF_NONE_MATCH, value);
    }
    if let Some(value) = cached
        .last_modified
        .as_deref()
        .and_then(|date| HeaderValue::from_str(date).ok())
    {
        headers.insert(IF_MODIFIED_SINCE, value);
    }
}

struct Recorder {
    inner: BodyStream,
    buffer: BytesMut,
    recording: bool,
    cache: MemoryCache<CachedResponse>,
    key: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Pass `body` through unchanged and remember it once it completes without error.
fn record_body(
    inner: BodyStream,
    cache: MemoryCache<CachedResponse>,
    key: String,
    etag: Option<String>,
    last_modified: Option<String>,
) -> BodyStream {
    let recorder = Recorder {
        inner,
        buffer: BytesMut::new(),
        recording: true,
        cache,
        key,
        etag,
        last_modified,
    };

    stream::unfold(Some(recorder), |state| async move {
        let mut recorder = state?;
        match recorder.inner.next().await {
            Some(Ok(chunk)) => {
                if recorder.recording {
                    if (recorder.buffer.len() + chunk.len()) as u64 > recorder.cache.max_cost() {
                        recorder.recording = false;
                        recorder.buffer = BytesMut::new();
                    } else {
                        recorder.buffer.extend_from_slice(&chunk);
                    }
                }
                Some((Ok(chunk), Some(recorder)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                if recorder.recording {
                    recorder.cache.insert(
                        recorder.key,
                        CachedResponse {
                            body: recorder.buffer.freeze(),
                            etag: recorder.etag,
                            last_modified: recorder.last_modified,
                        },
                    );
                }
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static [u8]]) -> BodyStream {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[test]
    fn test_apply_validators() {
        let mut headers = HeaderMap::new();
        apply_validators(
            &mut headers,
            &CachedResponse {
                body: Bytes::new(),
                etag: Some("\"v1\"".to_string()),
                last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
            },
        );

        assert_eq!(headers.get(IF_NONE_MATCH).unwrap().to_str().unwrap(), "\"v1\"");
        assert_eq!(
            headers.get(IF_MODIFIED_SINCE).unwrap().to_str().unwrap(),
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
    }

    #[tokio::test]
    async fn test_completed_body_is_recorded() {
        let cache = MemoryCache::new(1024, None);
        let body = record_body(
            chunks(&[b"ab", b"cd"]),
            cache.clone(),
            "https://example.com/a.png".to_string(),
            Some("\"tag\"".to_string()),
            None,
        );

        let received: Vec<Bytes> = body.try_collect().await.unwrap();
        assert_eq!(received.len(), 2);

        let cached = cache.get("https://example.com/a.png").unwrap();
        assert_eq!(cached.body, Bytes::from_static(b"abcd"));
        assert_eq!(cached.etag.as_deref(), Some("\"tag\""));
    }

    #[tokio::test]
    async fn test_failed_or_oversized_body_is_not_recorded() {
        let cache = MemoryCache::new(3, None);
        let body = record_body(
            chunks(&[b"ab", b"cd"]),
            cache.clone(),
            "big".to_string(),
            None,
            None,
        );
        let _: Vec<Bytes> = body.try_collect().await.unwrap();
        assert!(cache.get("big").is_none());

        let failing: BodyStream = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(TransportError::new(
                TransportErrorKind::NetworkConnectionLost,
                "reset",
            )),
        ])
        .boxed();
        let body = record_body(failing, cache.clone(), "broken".to_string(), None, None);
        assert!(body.try_collect::<Vec<Bytes>>().await.is_err());
        assert!(cache.get("broken").is_none());
    }

    #[test]
    fn test_clients_are_reused_per_flag_set() {
        let transport = HttpTransport::new(DownloaderConfig::default());
        let plain = SessionFlags {
            cookies: false,
            invalid_certs: false,
        };
        let cookies = SessionFlags {
            cookies: true,
            invalid_certs: false,
        };

        transport.client(plain).unwrap();
        transport.client(plain).unwrap();
        transport.client(cookies).unwrap();
        assert_eq!(transport.clients.lock().len(), 2);
    }
}
