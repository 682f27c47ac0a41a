//! # Downloader configuration builder
//!
//! ```
//! use std::time::Duration;
//! use pixfetch_engine::{DownloaderConfig, ExecutionOrder};
//! use pixfetch_engine::proxy::{ProxyConfig, ProxyType};
//!
//! let config = DownloaderConfig::builder()
//!     .with_download_timeout(Duration::from_secs(30))
//!     .with_max_concurrent_downloads(4)
//!     .with_execution_order(ExecutionOrder::Lifo)
//!     .with_header("Referer", "https://example.com/gallery")
//!     .with_proxy(ProxyConfig::new("socks5://127.0.0.1:1080", ProxyType::Socks5))
//!     .build();
//!
//! assert_eq!(config.max_concurrent_downloads, 4);
//! assert!(!config.use_system_proxy);
//! ```

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::{DownloaderConfig, ExecutionOrder};
use crate::proxy::ProxyConfig;
use crate::transport::Credentials;

#[derive(Debug, Clone, Default)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-request deadline, covering the whole transfer.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add one header on top of the current set. Names or values that are not
    /// valid HTTP are skipped.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        let name = HeaderName::try_from(name.as_ref());
        let value = HeaderValue::try_from(value.as_ref());
        if let (Ok(name), Ok(value)) = (name, value) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Replace the whole header set, including the default `Accept`.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Route requests through `proxy`. Turns off the system proxy.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self.config.use_system_proxy = false;
        self
    }

    /// Ignored once an explicit proxy is set.
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        self.config.use_system_proxy = self.config.proxy.is_none() && use_system_proxy;
        self
    }

    /// Accept any certificate on every request, not only on requests that ask for it.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.danger_accept_invalid_certs = accept;
        self
    }

    /// Clamped to at least one.
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.config.max_concurrent_downloads = max.max(1);
        self
    }

    pub fn with_execution_order(mut self, order: ExecutionOrder) -> Self {
        self.config.execution_order = order;
        self
    }

    pub fn with_decompress_images(mut self, decompress: bool) -> Self {
        self.config.decompress_images = decompress;
        self
    }

    /// Answer authentication challenges with `credentials`.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> DownloaderConfig {
        self.config
    }
}
