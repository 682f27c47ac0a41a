//! # Operation Registry
//!
//! Keeps at most one in-flight operation per key for an owner, typically a view
//! that should only ever show the result of its latest request.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::Cancelable;

pub struct OperationRegistry<K> {
    operations: Mutex<HashMap<K, Arc<dyn Cancelable>>>,
}

impl<K: Eq + Hash> OperationRegistry<K> {
    pub fn new() -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Track `operation` under `key`, cancelling whatever was tracked there before.
    pub fn set_operation(&self, key: K, operation: Arc<dyn Cancelable>) {
        let previous = self.operations.lock().insert(key, operation);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel and forget the operation under `key`.
    pub fn cancel_operation(&self, key: &K) -> bool {
        let removed = self.operations.lock().remove(key);
        match removed {
            Some(operation) => {
                operation.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the operation under `key` without cancelling it.
    pub fn remove_operation(&self, key: &K) -> bool {
        self.operations.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.operations.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }
}

impl<K: Eq + Hash> Default for OperationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Cancelable for Counter {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Counter {
        fn cancelled(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_replacing_cancels_previous() {
        let registry = OperationRegistry::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        registry.set_operation("avatar", first.clone());
        registry.set_operation("avatar", second.clone());

        assert_eq!(first.cancelled(), 1);
        assert_eq!(second.cancelled(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_and_remove() {
        let registry = OperationRegistry::new();
        let cancelled = Arc::new(Counter::default());
        let removed = Arc::new(Counter::default());

        registry.set_operation(1, cancelled.clone());
        registry.set_operation(2, removed.clone());

        assert!(registry.cancel_operation(&1));
        assert!(!registry.cancel_operation(&1));
        assert_eq!(cancelled.cancelled(), 1);

        assert!(registry.remove_operation(&2));
        assert_eq!(removed.cancelled(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_tracks_manager_loads() {
        use crate::test_utils::{MockRoute, MockTransport};
        use crate::{ImageDownloader, ImageManager, LoadOptions};

        let transport = MockTransport::new();
        transport.route("http://x/a.png", MockRoute::hanging());
        let dir = tempfile::tempdir().unwrap();
        let manager = ImageManager::builder()
            .with_downloader(
                ImageDownloader::builder()
                    .with_transport(transport.clone())
                    .build(),
            )
            .with_cache_config(crate::CacheConfig {
                disk_cache_path: Some(dir.path().to_path_buf()),
                ..Default::default()
            })
            .build();

        let registry = OperationRegistry::new();
        let handle = manager.load("http://x/a.png", LoadOptions::empty());
        registry.set_operation("cell-0", handle.operation().clone());
        assert!(manager.is_running());

        assert!(registry.cancel_operation(&"cell-0"));
        assert!(handle.operation().is_cancelled());
        assert!(!manager.is_running());
    }
}
