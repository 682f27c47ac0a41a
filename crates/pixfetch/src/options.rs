//! Option sets accepted by the manager and the downloader.

use bitflags::bitflags;

use crate::transport::RequestPriority;

bitflags! {
    /// Options for [`ImageManager::load`](crate::ImageManager::load).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadOptions: u32 {
        /// Retry resources that are in the failure set.
        const RETRY_FAILED = 1 << 0;
        const LOW_PRIORITY = 1 << 1;
        /// Only keep the result in memory.
        const CACHE_MEMORY_ONLY = 1 << 2;
        /// Deliver partially decoded images while downloading.
        const PROGRESSIVE_DOWNLOAD = 1 << 3;
        /// Revalidate cached images against the server even on a cache hit.
        const REFRESH_CACHED = 1 << 4;
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        const HANDLE_COOKIES = 1 << 6;
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 7;
        const HIGH_PRIORITY = 1 << 8;
        /// Carried through for integrators that bind images to views; unused here.
        const AVOID_AUTO_SET_IMAGE = 1 << 9;
        const SCALE_DOWN_LARGE_IMAGES = 1 << 10;
        /// Also read disk data when the image is already in memory.
        const QUERY_DATA_WHEN_IN_MEMORY = 1 << 11;
        /// Query the disk cache on the calling thread.
        const QUERY_DISK_SYNC = 1 << 12;
        /// Never hit the network.
        const FROM_CACHE_ONLY = 1 << 13;
        /// Run the transform hook on animated images too.
        const TRANSFORM_ANIMATED_IMAGE = 1 << 14;
    }
}

bitflags! {
    /// Options for a single network fetch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FetchOptions: u32 {
        const LOW_PRIORITY = 1 << 0;
        const PROGRESSIVE_DOWNLOAD = 1 << 1;
        /// Let the transport answer from (and revalidate against) its response cache.
        const USE_PROTOCOL_CACHE = 1 << 2;
        /// Treat a body identical to the transport's cached one as "not modified".
        const IGNORE_CACHED_RESPONSE = 1 << 3;
        const CONTINUE_IN_BACKGROUND = 1 << 4;
        const HANDLE_COOKIES = 1 << 5;
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 6;
        const HIGH_PRIORITY = 1 << 7;
        const SCALE_DOWN_LARGE_IMAGES = 1 << 8;
    }
}

impl LoadOptions {
    /// Translate caller options into fetch options.
    ///
    /// Refreshing an image that is already cached disables progressive delivery and
    /// asks the fetch to report an unchanged body as "not modified".
    pub fn to_fetch_options(self, has_cached_image: bool) -> FetchOptions {
        let pairs = [
            (LoadOptions::LOW_PRIORITY, FetchOptions::LOW_PRIORITY),
            (LoadOptions::PROGRESSIVE_DOWNLOAD, FetchOptions::PROGRESSIVE_DOWNLOAD),
            (LoadOptions::REFRESH_CACHED, FetchOptions::USE_PROTOCOL_CACHE),
            (LoadOptions::CONTINUE_IN_BACKGROUND, FetchOptions::CONTINUE_IN_BACKGROUND),
            (LoadOptions::HANDLE_COOKIES, FetchOptions::HANDLE_COOKIES),
            (
                LoadOptions::ALLOW_INVALID_SSL_CERTIFICATES,
                FetchOptions::ALLOW_INVALID_SSL_CERTIFICATES,
            ),
            (LoadOptions::HIGH_PRIORITY, FetchOptions::HIGH_PRIORITY),
            (LoadOptions::SCALE_DOWN_LARGE_IMAGES, FetchOptions::SCALE_DOWN_LARGE_IMAGES),
        ];

        let mut fetch = FetchOptions::empty();
        for (load, mapped) in pairs {
            if self.contains(load) {
                fetch |= mapped;
            }
        }

        if has_cached_image && self.contains(LoadOptions::REFRESH_CACHED) {
            fetch.remove(FetchOptions::PROGRESSIVE_DOWNLOAD);
            fetch |= FetchOptions::IGNORE_CACHED_RESPONSE;
        }

        fetch
    }
}

impl FetchOptions {
    pub fn priority(self) -> RequestPriority {
        if self.contains(FetchOptions::HIGH_PRIORITY) {
            RequestPriority::High
        } else if self.contains(FetchOptions::LOW_PRIORITY) {
            RequestPriority::Low
        } else {
            RequestPriority::Normal
        }
    }
}
