//! # Cache Utilities
//!
//! Common utility functions for cache operations.

use reqwest::header::{CONTENT_TYPE, ETAG, HeaderMap, HeaderName, LAST_MODIFIED};

/// Extract common cache-related headers from an HTTP response
pub fn extract_cache_headers(
    headers: &HeaderMap,
) -> (Option<String>, Option<String>, Option<String>) {
    let value = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    (value(ETAG), value(LAST_MODIFIED), value(CONTENT_TYPE))
}
