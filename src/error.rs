//! Error taxonomy for the gateway.
//!
//! Errors are split by the reaction they require: protocol and connection
//! errors are contained at the connection boundary, setup errors abort the
//! reactor before it serves anything.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Malformed SCGI framing. The connection is closed without a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The netstring length prefix contained something other than digits.
    #[error("invalid protocol (expected length, got {0:?})")]
    ExpectedLength(String),

    /// More digits than any sane header block needs.
    #[error("length prefix exceeds {max} digits")]
    LengthTooLong { max: usize },

    /// The header block split into an odd number of NUL-separated tokens.
    #[error("header block has an odd number of tokens ({0})")]
    OddHeaderTokens(usize),

    /// A header name or value was not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    HeaderEncoding,

    /// `SCGI` header missing or not equal to `1`.
    #[error("request is not SCGI/1 compliant")]
    NotScgi,

    #[error("CONTENT_LENGTH header not present")]
    MissingContentLength,

    #[error("invalid CONTENT_LENGTH {0:?}")]
    InvalidContentLength(String),

    /// Header block plus body exceed the configured limit.
    #[error("request of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: usize, max: usize },

    /// Bytes beyond the declared body. SCGI/1 carries one request per
    /// connection, so these are never interpreted.
    #[error("{0} unexpected bytes after request body")]
    TrailingData(usize),
}

/// Reasons a single connection is torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Zero bytes before any length digit: a spurious wakeup from the peer,
    /// discarded without being reported as a failure.
    #[error("empty request")]
    EmptyRequest,

    #[error("EOF")]
    Eof,

    #[error("timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The handler failed or panicked.
    #[error("application error: {0}")]
    Application(String),

    /// The peer sent bytes after the request was complete.
    #[error("data received while not reading")]
    UnexpectedData,
}

impl ConnectionError {
    /// Whether this outcome is routine and should not be logged as a failure.
    pub fn is_silent(&self) -> bool {
        matches!(self, ConnectionError::EmptyRequest)
    }
}

/// Failures creating or running the reactor itself. Fatal to the transport.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create event poller: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register listener: {0}")]
    Register(#[source] io::Error),
}

/// Invalid handler output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("flat header list has odd length {0}")]
    OddHeaderPairs(usize),
}
