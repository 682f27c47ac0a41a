//! # Cache Providers
//!
//! Storage tiers and the provider contract.

pub use self::file::FileCache;
pub use self::memory::{CacheCost, MemoryCache};
pub use self::provider::ImageCacheProvider;

pub mod provider;

pub mod file;
pub mod memory;
