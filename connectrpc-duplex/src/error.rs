//! Stream-level error types.
//!
//! This module provides [`StreamError`], the error returned by every
//! operation on a [`DuplexStream`](crate::DuplexStream) and by the typed
//! client and handler wrappers built on top of it.

use connectrpc_duplex_core::{Code, EnvelopeError, ProtocolError, Status};

use crate::conn::ConnError;

/// Errors surfaced by stream operations.
///
/// Lifecycle errors (`SendAfterClose`, `AlreadyClosed`, `Canceled`,
/// `DeadlineExceeded`) describe the local state of the stream. `Status`
/// carries the terminal error reported by the peer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    /// `send` was called after `close_send`.
    #[error("send after close")]
    SendAfterClose,

    /// The peer went away while the stream was still open.
    #[error("connection closed by peer")]
    ConnClosed,

    /// The call's context was canceled.
    #[error("stream canceled")]
    Canceled,

    /// The call's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The stream was closed by the caller.
    #[error("stream already closed")]
    AlreadyClosed,

    /// The peer answered with a content type or protocol we cannot speak.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The body ended without a terminal frame or trailers.
    #[error("unexpected end of stream: {0}")]
    UnexpectedStreamEnd(String),

    /// Malformed, truncated or oversized frame.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Any other protocol violation.
    #[error(transparent)]
    Protocol(ProtocolError),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Terminal status reported by the peer.
    #[error(transparent)]
    Status(#[from] Status),
}

impl StreamError {
    /// The status code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            StreamError::SendAfterClose | StreamError::AlreadyClosed => Code::FailedPrecondition,
            StreamError::ConnClosed | StreamError::Transport(_) => Code::Unavailable,
            StreamError::Canceled => Code::Canceled,
            StreamError::DeadlineExceeded => Code::DeadlineExceeded,
            StreamError::UnsupportedProtocol(_) => Code::Unknown,
            StreamError::UnexpectedStreamEnd(_) => Code::Internal,
            StreamError::Envelope(err) => err.code(),
            StreamError::Protocol(err) => err.code(),
            StreamError::Status(status) => status.code(),
        }
    }

    /// The peer's status, if this error carries one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            StreamError::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Convert into a [`Status`], keeping the peer's status when present.
    pub fn into_status(self) -> Status {
        match self {
            StreamError::Status(status) => status,
            other => Status::new(other.code(), other.to_string()),
        }
    }

    /// Whether this error came from cancellation or the deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Canceled | StreamError::DeadlineExceeded)
    }
}

impl From<ProtocolError> for StreamError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnsupportedProtocol(value) => StreamError::UnsupportedProtocol(value),
            ProtocolError::UnexpectedStreamEnd(reason) => StreamError::UnexpectedStreamEnd(reason),
            other => StreamError::Protocol(other),
        }
    }
}

impl From<ConnError> for StreamError {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::Closed => StreamError::ConnClosed,
            ConnError::Canceled => StreamError::Canceled,
            ConnError::Transport(message) => StreamError::Transport(message),
        }
    }
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        err.into_status()
    }
}

/// Errors building a client or transport.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BuildError {
    /// The base URL is not a valid absolute URI.
    #[error("invalid base url: {0}")]
    InvalidUrl(String),

    /// The TLS configuration could not be built.
    #[error("tls configuration: {0}")]
    Tls(String),
}
