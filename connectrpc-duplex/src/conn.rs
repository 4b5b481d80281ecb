//! The transport-facing surface the duplex stream is built on.
//!
//! A [`Conn`] is one HTTP exchange seen from one side: a send half that
//! writes body frames, a receive half that reads the peer's body, and a
//! cancel switch. [`ClientConn`] drives an outgoing request through a
//! [`HyperTransport`](crate::HyperTransport); [`HandlerConn`] answers an
//! incoming request inside an axum handler.
//!
//! Both implementations follow the same shape: the outgoing body is a
//! [`ChannelBody`] fed through a bounded channel, and the incoming body is
//! driven by a spawned pump task that owns the HTTP exchange. Cancelling the
//! conn aborts the pump, which drops the peer's body and releases the
//! underlying connection; [`Conn::closed`] resolves once that has happened.

mod body;
mod client;
mod handler;
mod pump;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, StatusCode, Version};

pub use body::ChannelBody;
pub use client::ClientConn;
pub use handler::HandlerConn;

pub(crate) use body::BodySender;
pub(crate) use pump::{BodyPump, pump_body};

/// Default capacity of the channels between a conn and its body.
pub const DEFAULT_BUFFER: usize = 16;

/// Errors reported by a [`Conn`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// The peer is gone or the send half was already closed.
    #[error("connection closed")]
    Closed,

    /// The conn was cancelled.
    #[error("connection canceled")]
    Canceled,

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The head of the peer's message: the response head on the client, the
/// request head in a handler (where `status` is always `200 OK`).
#[derive(Debug, Clone)]
pub struct PeerHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

type RequestHook = Arc<dyn Fn(&Parts) + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&PeerHead) + Send + Sync>;

/// Observers of a client exchange's two heads.
///
/// `on_request_send` runs in the exchange's pump task right before the
/// request is handed to the transport; `on_response_receive` runs there
/// once the response head arrived, before any reader sees it. Both run at
/// most once per exchange and must not block.
///
/// ```ignore
/// let hooks = ConnHooks::new()
///     .on_request_send(|parts| tracing::info!(uri = %parts.uri, "sending"))
///     .on_response_receive(|head| tracing::info!(status = %head.status, "answered"));
/// let client = Client::builder(url).hooks(hooks).build()?;
/// ```
#[derive(Clone, Default)]
pub struct ConnHooks {
    request_send: Option<RequestHook>,
    response_receive: Option<ResponseHook>,
}

impl ConnHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Parts) + Send + Sync + 'static,
    {
        self.request_send = Some(Arc::new(hook));
        self
    }

    pub fn on_response_receive<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerHead) + Send + Sync + 'static,
    {
        self.response_receive = Some(Arc::new(hook));
        self
    }

    pub(crate) fn request_sent(&self, parts: &Parts) {
        if let Some(hook) = &self.request_send {
            hook(parts);
        }
    }

    pub(crate) fn response_received(&self, head: &PeerHead) {
        if let Some(hook) = &self.response_receive {
            hook(head);
        }
    }
}

impl std::fmt::Debug for ConnHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHooks")
            .field("on_request_send", &self.request_send.is_some())
            .field("on_response_receive", &self.response_receive.is_some())
            .finish()
    }
}

/// One HTTP exchange.
///
/// Every method takes `&self` so a sender, a receiver and a closer can work
/// on the same conn from different tasks. [`cancel`](Conn::cancel) must make
/// blocked reads and writes return [`ConnError::Canceled`] promptly and must
/// release the underlying connection.
pub trait Conn: Send + Sync + 'static {
    /// Write one chunk of the outgoing body.
    fn write(&self, data: Bytes) -> impl Future<Output = Result<(), ConnError>> + Send;

    /// Finish the outgoing body with HTTP trailers.
    fn write_trailers(
        &self,
        trailers: HeaderMap,
    ) -> impl Future<Output = Result<(), ConnError>> + Send;

    /// Half-close the outgoing body. Idempotent.
    fn close_send(&self);

    /// Read the next chunk of the peer's body; `Ok(None)` at the true end.
    fn read(&self) -> impl Future<Output = Result<Option<Bytes>, ConnError>> + Send;

    /// Wait for the head of the peer's message.
    fn peer_head(&self) -> impl Future<Output = Result<PeerHead, ConnError>> + Send;

    /// HTTP trailers of the peer's body; only meaningful after `read`
    /// returned `Ok(None)`.
    fn trailers(&self) -> Option<HeaderMap>;

    /// Abort the exchange. Idempotent.
    fn cancel(&self);

    /// Resolve once the transport has released the exchange.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Whether the peer has finished or abandoned the exchange.
    fn is_peer_closed(&self) -> bool;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
