//! Error types shared by every module in this crate.

use std::fmt;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors this crate's sockets, listeners, and workers can produce.
///
/// Each variant carries a ready-to-display message; callers that need the
/// literal wording (tests assert on prefixes) should match on the message,
/// not the variant, since the variant exists for coarse-grained handling.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// Connect, bind, read, or write failure with a POSIX cause embedded.
    #[error("{0}")]
    Transport(String),

    /// DNS resolution returned no usable address.
    #[error("{0}")]
    Resolve(String),

    /// A read buffer would overflow a configured capacity cap.
    #[error("capacity exceeded")]
    Capacity,

    /// TLS handshake failed, including verification failure.
    #[error("{0}")]
    TlsHandshake(String),

    /// A TLS record could not be decoded after the handshake completed.
    #[error("{0}")]
    TlsProtocol(String),

    /// TLS handshake did not complete before its deadline.
    #[error("{0}")]
    TlsTimeout(String),

    /// Invalid start data: bad address, bad port, conflicting fields, or
    /// a bad backlog.
    #[error("{0}")]
    Configuration(String),
}

impl Error {
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn resolve<S: Into<String>>(msg: S) -> Self {
        Self::Resolve(msg.into())
    }

    pub fn tls_handshake<S: Into<String>>(msg: S) -> Self {
        Self::TlsHandshake(msg.into())
    }

    pub fn tls_protocol<S: Into<String>>(msg: S) -> Self {
        Self::TlsProtocol(msg.into())
    }

    pub fn tls_timeout<S: Into<String>>(msg: S) -> Self {
        Self::TlsTimeout(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Formats a POSIX errno the way §4.3 of the spec requires:
    /// `"POSIX error E<NAME>(<n>): <strerror>."`
    pub fn format_posix(err: &std::io::Error) -> String {
        let code = err.raw_os_error().unwrap_or(0);
        let name = posix_errno_name(code);
        // std's Display for io::Error already renders strerror(3) text.
        let mut msg = format!("POSIX error {name}({code}): {err}");
        if !msg.ends_with('.') {
            msg.push('.');
        }
        msg
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(Error::format_posix(&err))
    }
}

fn posix_errno_name(code: i32) -> &'static str {
    match code {
        13 => "EACCES",
        98 => "EADDRINUSE",
        99 => "EADDRNOTAVAIL",
        111 => "ECONNREFUSED",
        110 => "ETIMEDOUT",
        104 => "ECONNRESET",
        32 => "EPIPE",
        _ => "EUNKNOWN",
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coarse classification of the events a socket or worker emits, used only
/// for logging/metrics — not part of the wire or callback contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Encrypted,
    ReceivedData,
    SentData,
    Disconnected,
    Error,
}
