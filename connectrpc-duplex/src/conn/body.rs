//! Outgoing body fed through a bounded channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Frame};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};

use super::{ConnError, lock};

/// An [`http_body::Body`] whose frames are written by a conn.
///
/// The body ends cleanly once the conn half-closes. If the conn is cancelled
/// while the body is waiting for frames, the body yields
/// [`ConnError::Canceled`] so hyper resets the stream instead of finishing
/// it. Dropping the body (hyper is done with it, or the peer went away)
/// raises the conn's peer-closed signal.
pub struct ChannelBody {
    frames: mpsc::Receiver<Frame<Bytes>>,
    canceled: Pin<Box<WaitForCancellationFutureOwned>>,
    _peer_gone: Option<DropGuard>,
}

impl ChannelBody {
    pub(crate) fn channel(
        capacity: usize,
        cancel: CancellationToken,
        peer_gone: Option<CancellationToken>,
    ) -> (BodySender, ChannelBody) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = BodySender {
            tx: Mutex::new(Some(tx)),
            cancel: cancel.clone(),
        };
        let body = ChannelBody {
            frames: rx,
            canceled: Box::pin(cancel.cancelled_owned()),
            _peer_gone: peer_gone.map(CancellationToken::drop_guard),
        };
        (sender, body)
    }

    /// A body with no frames.
    pub fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        ChannelBody {
            frames: rx,
            canceled: Box::pin(CancellationToken::new().cancelled_owned()),
            _peer_gone: None,
        }
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = ConnError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match this.frames.poll_recv(cx) {
            Poll::Ready(frame) => Poll::Ready(frame.map(Ok)),
            Poll::Pending => match this.canceled.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(ConnError::Canceled))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for ChannelBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBody").finish_non_exhaustive()
    }
}

/// Write half of a [`ChannelBody`].
#[derive(Debug)]
pub(crate) struct BodySender {
    tx: Mutex<Option<mpsc::Sender<Frame<Bytes>>>>,
    cancel: CancellationToken,
}

impl BodySender {
    pub(crate) async fn send_data(&self, data: Bytes) -> Result<(), ConnError> {
        self.send(Frame::data(data)).await
    }

    /// Send trailers and end the body.
    pub(crate) async fn send_trailers(&self, trailers: HeaderMap) -> Result<(), ConnError> {
        let result = self.send(Frame::trailers(trailers)).await;
        self.close();
        result
    }

    async fn send(&self, frame: Frame<Bytes>) -> Result<(), ConnError> {
        // Clone so the lock is not held across the await; `close` drops the
        // stored sender and the body ends once in-flight sends complete.
        let tx = lock(&self.tx).clone().ok_or(ConnError::Closed)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnError::Canceled),
            sent = tx.send(frame) => sent.map_err(|_| ConnError::Closed),
        }
    }

    pub(crate) fn close(&self) {
        lock(&self.tx).take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.tx).as_ref().is_none_or(|tx| tx.is_closed())
    }
}
