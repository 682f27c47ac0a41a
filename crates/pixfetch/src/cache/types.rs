//! # Cache Types
//!
//! Common types used across the image cache.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bitmap::Image;

/// Where a cached image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    /// Not served from the cache (downloaded or missing)
    #[default]
    None,
    Disk,
    Memory,
}

/// Result of a cache query.
#[derive(Debug, Clone, Default)]
pub struct CachedImage {
    pub image: Option<Image>,
    pub data: Option<Bytes>,
    pub cache_type: CacheType,
}

impl CachedImage {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn is_miss(&self) -> bool {
        self.image.is_none() && self.data.is_none()
    }
}

/// How a disk query should treat the bytes it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskQuery {
    /// Decode the bytes into an image (skipped when memory already holds one)
    pub decode: bool,
    /// Scale large images down while decoding
    pub scale_down: bool,
}

impl Default for DiskQuery {
    fn default() -> Self {
        Self {
            decode: true,
            scale_down: false,
        }
    }
}

/// Convert a cache key into a filename-safe string
pub fn cache_file_name(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    format!("{hash:x}")
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Metadata stored next to every cached file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Original cache key
    pub key: String,
    /// When the resource was cached
    pub cached_at: u64,
    /// When the resource expires
    pub expires_at: Option<u64>,
    /// MIME type of the stored bytes
    pub content_type: Option<String>,
    /// Size of the cached resource in bytes
    pub size: u64,
}

impl CacheMetadata {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            cached_at: unix_now(),
            expires_at: None,
            content_type: None,
            size,
        }
    }

    pub fn with_expiration(mut self, duration: Duration) -> Self {
        self.expires_at = Some(self.cached_at + duration.as_secs());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < unix_now(),
            None => false,
        }
    }
}

/// Configuration for the image cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Path for disk cache storage; a directory under the system temp dir when unset
    pub disk_cache_path: Option<PathBuf>,
    /// Maximum size of the disk cache in bytes (0 disables the disk tier)
    pub max_disk_cache_size: u64,
    /// Maximum total cost of decoded images kept in memory (0 disables the memory tier)
    pub max_memory_cost: u64,
    /// How long a file stays valid on disk
    pub max_cache_age: Duration,
    /// Keep images decoded from disk in memory
    pub cache_images_in_memory: bool,
    /// Decompress images decoded from disk
    pub decompress_images: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disk_cache_path: None,
            max_disk_cache_size: 500 * 1024 * 1024,    // 500MB
            max_memory_cost: 100 * 1024 * 1024,        // 100MB of pixels
            max_cache_age: Duration::from_secs(7 * 24 * 60 * 60), // 1 week
            cache_images_in_memory: true,
            decompress_images: true,
        }
    }
}

/// Outcome of a disk sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_expired: usize,
    pub removed_for_size: usize,
    pub remaining_bytes: u64,
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, std::io::Error>;
