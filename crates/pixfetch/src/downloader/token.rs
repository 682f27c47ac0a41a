use std::fmt;
use std::sync::Weak;

use url::Url;

use super::operation::FetchOperation;
use crate::cancel::Cancelable;

/// One registration inside a [`FetchOperation`].
///
/// The token does not keep the operation alive; cancelling a token whose
/// operation is gone is a no-op.
#[derive(Clone)]
pub struct DownloadToken {
    url: Url,
    operation: Weak<FetchOperation>,
    handler_id: u64,
}

impl DownloadToken {
    pub(crate) fn new(url: Url, operation: Weak<FetchOperation>, handler_id: u64) -> Self {
        Self {
            url,
            operation,
            handler_id,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn handler_id(&self) -> u64 {
        self.handler_id
    }

    /// Remove this registration. Returns `true` when it was the last one and the
    /// whole transfer was cancelled as a result.
    pub fn cancel(&self) -> bool {
        match self.operation.upgrade() {
            Some(operation) => operation.cancel(self.handler_id),
            None => false,
        }
    }
}

impl Cancelable for DownloadToken {
    fn cancel(&self) {
        DownloadToken::cancel(self);
    }
}

impl fmt::Debug for DownloadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadToken")
            .field("url", &self.url.as_str())
            .field("handler_id", &self.handler_id)
            .finish()
    }
}
