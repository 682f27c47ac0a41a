//! # Cache Provider
//!
//! The contract the manager uses to reach the image cache. Keys are the strings
//! produced by the manager's cache key filter.

use async_trait::async_trait;
use bytes::Bytes;

use crate::bitmap::Image;
use crate::cache::types::{CachedImage, DiskQuery};

/// A two-tier image store: a synchronous memory tier and an asynchronous disk tier.
#[async_trait]
pub trait ImageCacheProvider: Send + Sync {
    /// Memory-tier lookup; never touches the disk.
    fn lookup_memory(&self, key: &str) -> Option<Image>;

    /// Memory then disk lookup.
    async fn query_disk(&self, key: &str, query: DiskQuery) -> CachedImage;

    /// Same as [`ImageCacheProvider::query_disk`], blocking the calling thread.
    fn query_disk_blocking(&self, key: &str, query: DiskQuery) -> CachedImage;

    fn exists_in_memory(&self, key: &str) -> bool;

    async fn exists_on_disk(&self, key: &str) -> bool;

    /// Store an image and/or its encoded bytes. The disk tier is skipped unless
    /// `to_disk` is set.
    async fn store(&self, image: Option<Image>, data: Option<Bytes>, key: &str, to_disk: bool);
}
