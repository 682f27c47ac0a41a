use url::Url;

use crate::bitmap::Image;
use crate::error::FetchError;

/// Policy hooks consulted by the [`ImageManager`](super::ImageManager).
///
/// Every method has a default, so implementors only override what they need.
pub trait ManagerDelegate: Send + Sync {
    /// Whether a cache miss (or a refresh) for `url` may go to the network.
    fn should_download(&self, _url: &Url) -> bool {
        true
    }

    /// Whether a failed `url` goes into the failure set.
    fn should_block_failed_url(&self, _url: &Url, error: &FetchError) -> bool {
        !error.is_transient()
    }

    /// Replace a freshly downloaded image before it is cached and delivered.
    ///
    /// Runs on a blocking worker. Animated images are only passed in when the load
    /// asked for [`LoadOptions::TRANSFORM_ANIMATED_IMAGE`](crate::LoadOptions::TRANSFORM_ANIMATED_IMAGE).
    /// Returning `None` keeps the original.
    fn transform_downloaded_image(&self, _image: &Image, _url: &Url) -> Option<Image> {
        None
    }
}
