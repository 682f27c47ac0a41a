use bytes::Bytes;
use url::Url;

use crate::bitmap::Image;
use crate::error::FetchError;

/// Transfer lifecycle notifications broadcast by the downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadLifecycleEvent {
    Started { id: u64, url: Url },
    ResponseReceived { id: u64, url: Url, status: u16 },
    /// The transfer stopped, whether it completed, failed or was cancelled.
    Stopped { id: u64, url: Url },
    /// The transfer completed successfully.
    Finished { id: u64, url: Url },
}

impl DownloadLifecycleEvent {
    pub fn id(&self) -> u64 {
        match self {
            DownloadLifecycleEvent::Started { id, .. }
            | DownloadLifecycleEvent::ResponseReceived { id, .. }
            | DownloadLifecycleEvent::Stopped { id, .. }
            | DownloadLifecycleEvent::Finished { id, .. } => *id,
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            DownloadLifecycleEvent::Started { url, .. }
            | DownloadLifecycleEvent::ResponseReceived { url, .. }
            | DownloadLifecycleEvent::Stopped { url, .. }
            | DownloadLifecycleEvent::Finished { url, .. } => url,
        }
    }
}

/// Result of a completed transfer.
///
/// Both fields are `None` when the server's answer matched the bytes the
/// transport already held (not modified).
#[derive(Debug, Clone, Default)]
pub struct Downloaded {
    pub image: Option<Image>,
    pub data: Option<Bytes>,
}

impl Downloaded {
    pub fn is_not_modified(&self) -> bool {
        self.image.is_none() && self.data.is_none()
    }
}

/// Events delivered to one download registration, in order. `Finished` is always last.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress {
        received: u64,
        expected: Option<u64>,
    },
    /// A partially decoded image; never the final instance.
    Partial(Image),
    Finished(Result<Downloaded, FetchError>),
}
