//! # Image Cache
//!
//! Two-tier storage for fetched images: decoded images in memory, encoded bytes
//! on disk. The manager only talks to it through [`ImageCacheProvider`].

mod manager;
pub mod providers;
mod types;
mod utils;

pub use manager::ImageCache;
pub use types::{
    CacheConfig, CacheMetadata, CacheResult, CacheType, CachedImage, DiskQuery, SweepStats,
    cache_file_name,
};
pub use utils::extract_cache_headers;

pub use providers::{CacheCost, FileCache, ImageCacheProvider, MemoryCache};
