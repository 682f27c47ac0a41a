use std::collections::HashSet;

use parking_lot::Mutex;
use url::Url;

/// URLs whose last fetch failed in a way that is not expected to recover.
///
/// Entries live until they are removed explicitly; a successful load with
/// [`LoadOptions::RETRY_FAILED`](crate::LoadOptions::RETRY_FAILED) removes one.
#[derive(Debug, Default)]
pub struct FailedUrls {
    urls: Mutex<HashSet<Url>>,
}

impl FailedUrls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.urls.lock().contains(url)
    }

    /// Returns `false` if the URL was already present.
    pub fn insert(&self, url: Url) -> bool {
        self.urls.lock().insert(url)
    }

    pub fn remove(&self, url: &Url) -> bool {
        self.urls.lock().remove(url)
    }

    pub fn clear(&self) {
        self.urls.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.lock().is_empty()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_clear() {
        let failed = FailedUrls::new();
        let a = Url::parse("http://x/a.png").unwrap();
        let b = Url::parse("http://x/b.png").unwrap();

        assert!(failed.insert(a.clone()));
        assert!(!failed.insert(a.clone()));
        failed.insert(b.clone());
        assert_eq!(failed.len(), 2);

        assert!(failed.remove(&a));
        assert!(!failed.contains(&a));
        assert!(failed.contains(&b));

        failed.clear();
        assert!(failed.is_empty());
        assert!(failed.urls().is_empty());
    }
}
