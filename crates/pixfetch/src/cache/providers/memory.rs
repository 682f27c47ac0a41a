//! # Memory Cache Provider
//!
//! An in-memory cache weighted by value cost, using Moka.

use std::time::Duration;

use moka::sync::Cache as MokaCache;
use tracing::{debug, warn};

use crate::bitmap::Image;

/// Values that know how much memory they pin.
pub trait CacheCost {
    fn cost(&self) -> u64;
}

impl CacheCost for Image {
    fn cost(&self) -> u64 {
        Image::cost(self)
    }
}

/// Memory cache keyed by string, evicting by total cost.
#[derive(Clone)]
pub struct MemoryCache<V> {
    cache: MokaCache<String, V>,
    max_cost: u64,
}

impl<V> MemoryCache<V>
where
    V: CacheCost + Clone + Send + Sync + 'static,
{
    /// Create a new memory cache with the specified cost limit and optional TTL
    pub fn new(max_cost: u64, ttl: Option<Duration>) -> Self {
        if max_cost == 0 {
            panic!("Memory cache size must be greater than zero");
        }

        let mut builder = MokaCache::builder()
            .weigher(|_k: &String, v: &V| v.cost().try_into().unwrap_or(u32::MAX))
            .max_capacity(max_cost);

        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            builder = builder.time_to_live(ttl);
        }

        debug!(max_cost, ttl = ?ttl, "Memory cache created");

        Self {
            cache: builder.build(),
            max_cost,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.cache.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Insert a value; values costing more than the whole cache are skipped.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let cost = value.cost();
        if cost > self.max_cost {
            warn!(
                key = %key,
                cost,
                max_cost = self.max_cost,
                "Entry too large for memory cache, skipping"
            );
            return;
        }
        self.cache.insert(key, value);
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        debug!("Memory cache cleared");
    }

    /// Apply pending evictions now.
    pub fn sweep(&self) {
        self.cache.run_pending_tasks();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }
}
