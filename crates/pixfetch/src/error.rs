use url::Url;

use crate::transport::{TransportError, TransportErrorKind};

/// Error delivered through a load or download completion.
///
/// Errors are cloned into every registration sharing a transfer, so sources are
/// kept as owned values rather than boxed trait objects.
#[derive(Debug, thiserror::Error, Clone)]
pub enum FetchError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Resource previously failed and is blocklisted: {0}")]
    Blocklisted(Url),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Invalid response: HTTP status {status}")]
    InvalidResponse { status: u16 },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Transfer could not be created: {0}")]
    TaskInit(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// A transport that could not set up the request at all reports
/// [`TransportErrorKind::TaskInit`]; that surfaces as [`FetchError::TaskInit`].
impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        match err.kind() {
            TransportErrorKind::TaskInit => FetchError::TaskInit(err.message().to_string()),
            _ => FetchError::Transport(err),
        }
    }
}

impl FetchError {
    /// Whether the failure is likely to go away on its own (connectivity, timeouts).
    ///
    /// Used as the default blocklist policy: transient failures never add the
    /// resource to the failure set.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(err) => err.kind().is_transient(),
            FetchError::Cancelled => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}
