use std::sync::OnceLock;

use bytes::Bytes;
use http::{HeaderMap, Request};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug};

use super::{
    BodyPump, BodySender, ChannelBody, Conn, ConnError, ConnHooks, PeerHead, pump_body,
};
use crate::transport::HyperTransport;

type HeadResult = Result<PeerHead, ConnError>;

/// Client side of an exchange: the request body is a [`ChannelBody`], the
/// response is driven by the pump task, which also owns the request future.
#[derive(Debug)]
pub struct ClientConn {
    sender: BodySender,
    pump: BodyPump,
    head: OnceLock<HeadResult>,
    head_rx: tokio::sync::Mutex<Option<oneshot::Receiver<HeadResult>>>,
    cancel: CancellationToken,
}

impl ClientConn {
    /// Start the request described by `parts`. The request is sent as soon
    /// as the runtime polls the pump task; the body streams whatever is
    /// written to the conn.
    pub fn start(
        transport: HyperTransport,
        parts: http::request::Parts,
        buffer: usize,
        hooks: ConnHooks,
        span: Span,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (sender, body) = ChannelBody::channel(buffer, cancel.clone(), None);
        let (head_tx, head_rx) = oneshot::channel();

        let pump = BodyPump::spawn(cancel.clone(), buffer, move |events| {
            async move {
                hooks.request_sent(&parts);
                let request = Request::from_parts(parts, body);
                let response = match transport.request(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        debug!(error = %err, "request failed");
                        let _ = head_tx.send(Err(err));
                        return;
                    }
                };
                let (parts, body) = response.into_parts();
                debug!(status = %parts.status, version = ?parts.version, "response head received");
                let head = PeerHead {
                    status: parts.status,
                    version: parts.version,
                    headers: parts.headers,
                };
                hooks.response_received(&head);
                if head_tx.send(Ok(head)).is_err() {
                    return;
                }
                pump_body(body, events).await;
            }
            .instrument(span)
        });

        Self {
            sender,
            pump,
            head: OnceLock::new(),
            head_rx: tokio::sync::Mutex::new(Some(head_rx)),
            cancel,
        }
    }
}

impl ClientConn {
    /// The request body is gone. If the request itself failed (refused
    /// connection, reset before the head) report that failure; otherwise the
    /// server simply stopped reading.
    async fn body_dropped(&self) -> ConnError {
        match self.peer_head().await {
            Err(err @ (ConnError::Transport(_) | ConnError::Canceled)) => err,
            _ => ConnError::Closed,
        }
    }
}

impl Conn for ClientConn {
    async fn write(&self, data: Bytes) -> Result<(), ConnError> {
        match self.sender.send_data(data).await {
            Err(ConnError::Closed) => Err(self.body_dropped().await),
            other => other,
        }
    }

    async fn write_trailers(&self, trailers: HeaderMap) -> Result<(), ConnError> {
        match self.sender.send_trailers(trailers).await {
            Err(ConnError::Closed) => Err(self.body_dropped().await),
            other => other,
        }
    }

    fn close_send(&self) {
        self.sender.close();
    }

    async fn read(&self) -> Result<Option<Bytes>, ConnError> {
        self.pump.read().await
    }

    async fn peer_head(&self) -> Result<PeerHead, ConnError> {
        if let Some(head) = self.head.get() {
            return head.clone();
        }
        let mut head_rx = self.head_rx.lock().await;
        if let Some(head) = self.head.get() {
            return head.clone();
        }
        let Some(receiver) = head_rx.as_mut() else {
            return Err(ConnError::Closed);
        };
        let head = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ConnError::Canceled),
            head = receiver => head.unwrap_or(Err(ConnError::Closed)),
        };
        head_rx.take();
        self.head.get_or_init(|| head).clone()
    }

    fn trailers(&self) -> Option<HeaderMap> {
        self.pump.trailers()
    }

    fn cancel(&self) {
        self.cancel.cancel();
        self.pump.abort();
    }

    async fn closed(&self) {
        self.pump.finished().await
    }

    fn is_peer_closed(&self) -> bool {
        self.pump.is_finished()
    }
}
