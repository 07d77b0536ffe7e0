//! `ppg` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io};

use crate::{
    config::ParseError,
    protocol::DatabaseError,
    row::{DecodeError, RowNotFound},
};

/// A specialized [`Result`] type for `ppg` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `ppg` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

/// All possible error kind from `ppg` library.
pub enum ErrorKind {
    /// Malformed connection string.
    Config(ParseError),
    /// Caller side misuse, like a text parameter that is not valid UTF-8.
    Validation(ValidationError),
    /// HTTP transport failure.
    Http(HttpError),
    /// WebSocket transport failure.
    Ws(WsError),
    /// Server reported SQL error.
    Database(DatabaseError),
    /// The peer broke the frame protocol.
    Protocol(ProtocolError),
    /// Failed to decode a column value.
    Decode(DecodeError),
    /// Query expected a row but none returned.
    RowNotFound(RowNotFound),
    Io(io::Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ValidationError>e => ErrorKind::Validation(e));
from!(<HttpError>e => ErrorKind::Http(e));
from!(<WsError>e => ErrorKind::Ws(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<io::Error>e => ErrorKind::Io(e));

from!(<reqwest::Error>e => ErrorKind::Http(HttpError {
    status: e.status().map(|s|s.as_u16()),
    message: e.to_string(),
}));

from!(<tokio_tungstenite::tungstenite::Error>e => ErrorKind::Ws(WsError {
    message: e.to_string(),
    code: None,
    reason: None,
}));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Validation(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::Ws(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// ===== Validation =====

/// An error from caller side misuse.
pub struct ValidationError {
    reason: Cow<'static, str>,
}

impl ValidationError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> ValidationError {
        ValidationError { reason: reason.into() }
    }
}

impl std::error::Error for ValidationError { }

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl fmt::Debug for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// ===== Http =====

/// An error from the HTTP transport.
pub struct HttpError {
    pub status: Option<u16>,
    pub message: String,
}

impl HttpError {
    pub(crate) fn new(status: u16, message: String) -> HttpError {
        HttpError { status: Some(status), message }
    }
}

impl std::error::Error for HttpError { }

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "http status {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// ===== WebSocket =====

/// An error from the WebSocket transport.
#[derive(Clone)]
pub struct WsError {
    pub message: String,
    /// Close code when the connection was closed by the peer.
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl WsError {
    pub(crate) fn new(message: impl Into<String>) -> WsError {
        WsError { message: message.into(), code: None, reason: None }
    }

    pub(crate) fn closed(code: Option<u16>, reason: Option<String>) -> WsError {
        WsError { message: "connection closed".into(), code, reason }
    }
}

impl std::error::Error for WsError { }

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(reason) = self.reason.as_deref().filter(|r|!r.is_empty()) {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

// ===== Protocol =====

/// An error when the peer breaks frame ordering or framing rules.
#[derive(Clone)]
pub struct ProtocolError {
    reason: Cow<'static, str>,
}

impl ProtocolError {
    pub(crate) fn new(reason: impl Into<Cow<'static, str>>) -> ProtocolError {
        ProtocolError { reason: reason.into() }
    }
}

impl From<&'static str> for ProtocolError {
    fn from(reason: &'static str) -> ProtocolError {
        ProtocolError::new(reason)
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.reason)
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
