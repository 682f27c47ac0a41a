//! # Pixfetch
//!
//! Asynchronous image loading: download, decode and two-tier caching.
//!
//! ## Features
//!
//! - One network transfer per URL, shared by every concurrent request for it
//! - Memory and disk caches consulted before the network
//! - Progressive decoding of partially downloaded images
//! - Failure tracking that stops retrying resources that will not load
//! - Cancellation of individual requests or everything in flight
//!
//! ```no_run
//! use pixfetch_engine::{ImageManager, LoadOptions};
//!
//! # async fn run() {
//! let manager = ImageManager::builder().build();
//! let handle = manager.load("https://example.com/cat.png", LoadOptions::empty());
//! if let Some(completion) = handle.finished().await {
//!     match completion.result {
//!         Ok(loaded) => println!("cache type: {:?}", loaded.cache_type),
//!         Err(e) => eprintln!("failed: {e}"),
//!     }
//! }
//! # }
//! ```

pub mod bitmap;
pub mod builder;
pub mod cache;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod downloader;
pub mod error;
pub mod global;
pub mod host;
pub mod manager;
pub mod options;
pub mod proxy;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bitmap::{Image, ImageFormat};
pub use builder::DownloaderConfigBuilder;
pub use cache::{CacheConfig, CacheType, ImageCache, ImageCacheProvider};
pub use cancel::Cancelable;
pub use codec::{CodecChain, ImageCodec, ProgressiveDecoder, RasterCodec};
pub use config::{DownloaderConfig, ExecutionOrder};
pub use error::FetchError;
pub use host::{BackgroundTaskHost, DeadlineHost};
pub use options::{FetchOptions, LoadOptions};
pub use registry::OperationRegistry;

// Re-export downloader types
pub use downloader::{
    DownloadEvent, DownloadLifecycleEvent, DownloadToken, Downloaded, FetchOperation,
    ImageDownloader,
};

// Re-export manager types
pub use manager::{
    Completion, FailedUrls, ImageManager, ImageManagerBuilder, IntoResourceUrl, LoadEvent,
    LoadHandle, LoadOperation, LoadedImage, ManagerDelegate,
};

// Re-export proxy utilities
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use transport::{HttpTransport, Transport, TransportError, TransportErrorKind};
