use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;
use crate::transport::Credentials;

const DEFAULT_USER_AGENT: &str = concat!("pixfetch/", env!("CARGO_PKG_VERSION"));

/// Order in which queued downloads of equal priority are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ExecutionOrder {
    /// First queued, first started
    #[default]
    Fifo,
    /// Most recently queued starts first
    Lifo,
}

/// Configurable options for the image downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Timeout applied to each image request
    pub download_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// How long idle pooled connections are kept
    pub pool_idle_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Default HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    /// Accept invalid certificates for every request, not only flagged ones
    pub danger_accept_invalid_certs: bool,

    /// Maximum number of transfers running at the same time
    pub max_concurrent_downloads: usize,

    pub execution_order: ExecutionOrder,

    /// Decompress (and optionally scale down) images after decoding
    pub decompress_images: bool,

    /// Credentials used to answer authentication challenges
    pub credentials: Option<Credentials>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            max_concurrent_downloads: 6,
            execution_order: ExecutionOrder::Fifo,
            decompress_images: true,
            credentials: None,
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    /// Merge `config` with the default headers; custom headers win on conflicts.
    pub fn with_config(config: DownloaderConfig) -> Self {
        let mut headers = DownloaderConfig::get_default_headers();
        for (name, value) in config.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        Self { headers, ..config }
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/webp,image/*;q=0.8"),
        );

        default_headers
    }
}
