use std::sync::Mutex;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode, response};
use http_body::Body;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::{BodyPump, BodySender, ChannelBody, Conn, ConnError, PeerHead, lock, pump_body};

/// Handler side of an exchange: the request body is driven by the pump task,
/// the response body is a [`ChannelBody`].
///
/// The response head is handed to the caller through the receiver returned
/// by [`HandlerConn::start`] the first time [`HandlerConn::send_head`] runs.
#[derive(Debug)]
pub struct HandlerConn {
    sender: BodySender,
    pump: BodyPump,
    head: PeerHead,
    response_head: Mutex<Option<oneshot::Sender<response::Parts>>>,
    cancel: CancellationToken,
    peer_gone: CancellationToken,
}

impl HandlerConn {
    /// Take over `request`. Returns the conn, the receiver of the response
    /// head and the response body to hand back to hyper.
    pub fn start<B>(
        request: Request<B>,
        buffer: usize,
        span: Span,
    ) -> (Self, oneshot::Receiver<response::Parts>, ChannelBody)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = request.into_parts();
        let cancel = CancellationToken::new();
        let peer_gone = CancellationToken::new();
        let (sender, response_body) =
            ChannelBody::channel(buffer, cancel.clone(), Some(peer_gone.clone()));
        let (head_tx, head_rx) = oneshot::channel();
        let pump = BodyPump::spawn(cancel.clone(), buffer, move |events| {
            pump_body(body, events).instrument(span)
        });

        let conn = Self {
            sender,
            pump,
            head: PeerHead {
                status: StatusCode::OK,
                version: parts.version,
                headers: parts.headers,
            },
            response_head: Mutex::new(Some(head_tx)),
            cancel,
            peer_gone,
        };
        (conn, head_rx, response_body)
    }

    /// Send the response head. Only the first call has an effect; returns
    /// whether this call sent it.
    pub fn send_head(&self, status: StatusCode, headers: HeaderMap) -> bool {
        let Some(tx) = lock(&self.response_head).take() else {
            return false;
        };
        let (mut parts, ()) = http::Response::new(()).into_parts();
        parts.status = status;
        parts.headers = headers;
        // The receiver is gone only if the request future was dropped.
        let _ = tx.send(parts);
        true
    }

    pub fn head_sent(&self) -> bool {
        lock(&self.response_head).is_none()
    }

    /// Raised once hyper drops the response body: the exchange finished or
    /// the client went away.
    pub fn peer_gone(&self) -> &CancellationToken {
        &self.peer_gone
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.head.headers
    }
}

impl Conn for HandlerConn {
    async fn write(&self, data: Bytes) -> Result<(), ConnError> {
        self.sender.send_data(data).await
    }

    async fn write_trailers(&self, trailers: HeaderMap) -> Result<(), ConnError> {
        self.sender.send_trailers(trailers).await
    }

    fn close_send(&self) {
        self.sender.close();
    }

    async fn read(&self) -> Result<Option<Bytes>, ConnError> {
        self.pump.read().await
    }

    async fn peer_head(&self) -> Result<PeerHead, ConnError> {
        Ok(self.head.clone())
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
        self.peer_gone.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn test_reads_request_and_streams_response() {
        let request = Request::builder()
            .header("content-type", "application/grpc")
            .body(Full::new(Bytes::from_static(b"request")))
            .unwrap();
        let (conn, head_rx, mut body) = HandlerConn::start(request, 4, Span::none());
        assert_eq!(conn.request_headers()["content-type"], "application/grpc");
        assert_eq!(conn.read().await.unwrap().unwrap(), "request");
        assert_eq!(conn.read().await.unwrap(), None);

        assert!(conn.send_head(StatusCode::OK, HeaderMap::new()));
        assert!(!conn.send_head(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new()));
        assert!(conn.head_sent());
        assert_eq!(head_rx.await.unwrap().status, StatusCode::OK);

        conn.write(Bytes::from_static(b"response")).await.unwrap();
        conn.close_send();
        let data = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(data, "response");
        assert!(body.frame().await.is_none());

        assert!(!conn.is_peer_closed());
        drop(body);
        assert!(conn.is_peer_closed());
    }

    #[tokio::test]
    async fn test_cancel_releases_request_body() {
        let request = Request::new(Full::new(Bytes::new()));
        let (conn, _head_rx, _body) = HandlerConn::start(request, 4, Span::none());
        conn.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }
}
