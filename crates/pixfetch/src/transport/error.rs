use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Classification of a transport failure, independent of the HTTP stack in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// No network route is available at all.
    NotConnected,
    /// The transfer was cancelled before it completed.
    Cancelled,
    TimedOut,
    /// Roaming is disabled on the host device.
    InternationalRoamingOff,
    /// Cellular data is disallowed for this process.
    DataNotAllowed,
    /// DNS resolution failed.
    CannotFindHost,
    CannotConnectToHost,
    /// The connection dropped mid-transfer.
    NetworkConnectionLost,
    /// The client or request could not be constructed.
    TaskInit,
    Tls,
    Other,
}

impl TransportErrorKind {
    /// Failures that usually resolve without any change to the request.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::NotConnected
                | TransportErrorKind::Cancelled
                | TransportErrorKind::TimedOut
                | TransportErrorKind::InternationalRoamingOff
                | TransportErrorKind::DataNotAllowed
                | TransportErrorKind::CannotFindHost
                | TransportErrorKind::CannotConnectToHost
                | TransportErrorKind::NetworkConnectionLost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportErrorKind::NotConnected => "not connected",
            TransportErrorKind::Cancelled => "cancelled",
            TransportErrorKind::TimedOut => "timed out",
            TransportErrorKind::InternationalRoamingOff => "international roaming off",
            TransportErrorKind::DataNotAllowed => "data not allowed",
            TransportErrorKind::CannotFindHost => "cannot find host",
            TransportErrorKind::CannotConnectToHost => "cannot connect to host",
            TransportErrorKind::NetworkConnectionLost => "network connection lost",
            TransportErrorKind::TaskInit => "task initialization failed",
            TransportErrorKind::Tls => "tls failure",
            TransportErrorKind::Other => "transport failure",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Map a reqwest failure onto a transport kind.
///
/// reqwest only exposes coarse predicates, so connect and body failures are refined
/// by walking the source chain for the underlying `io::Error` or resolver message.
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::TimedOut
        } else if err.is_builder() {
            TransportErrorKind::TaskInit
        } else if err.is_connect() {
            classify_chain(&err).unwrap_or(TransportErrorKind::CannotConnectToHost)
        } else if err.is_body() || err.is_decode() || err.is_request() {
            classify_chain(&err).unwrap_or(TransportErrorKind::Other)
        } else {
            TransportErrorKind::Other
        };

        TransportError::new(kind, err.to_string())
    }
}

fn classify_chain(err: &(dyn StdError + 'static)) -> Option<TransportErrorKind> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(source) = current {
        if let Some(io_err) = source.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io(io_err.kind()) {
                return Some(kind);
            }
        }

        let message = source.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return Some(TransportErrorKind::CannotFindHost);
        }
        if message.contains("certificate") || message.contains("tls handshake") {
            return Some(TransportErrorKind::Tls);
        }

        current = source.source();
    }
    None
}

fn classify_io(kind: io::ErrorKind) -> Option<TransportErrorKind> {
    match kind {
        io::ErrorKind::TimedOut => Some(TransportErrorKind::TimedOut),
        io::ErrorKind::NotConnected | io::ErrorKind::NetworkUnreachable => {
            Some(TransportErrorKind::NotConnected)
        }
        io::ErrorKind::ConnectionRefused | io::ErrorKind::HostUnreachable => {
            Some(TransportErrorKind::CannotConnectToHost)
        }
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportErrorKind::NetworkConnectionLost),
        _ => None,
    }
}
