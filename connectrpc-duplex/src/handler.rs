//! Serving calls from axum routes.
//!
//! [`serve_stream`] turns an incoming request into a [`HandlerStream`],
//! runs the handler on its own task and answers with a streaming response
//! body. The protocol is picked from the request's content type, so one
//! route serves Connect, gRPC and gRPC-Web clients alike.
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, extract::Request, routing::post};
//! use connectrpc_duplex::{HandlerStream, ProtoCodec, StreamConfig, serve_stream};
//!
//! async fn count_up(request: Request) -> impl axum::response::IntoResponse {
//!     serve_stream(
//!         request,
//!         ProtoCodec,
//!         StreamConfig::default(),
//!         |stream: HandlerStream<CountUpRequest, CountUpResponse>| async move {
//!             let Some(request) = stream.receive().await? else {
//!                 return Err(Status::invalid_argument("missing request"));
//!             };
//!             for number in 1..=request.number {
//!                 stream.send(&CountUpResponse { number }).await?;
//!             }
//!             Ok(())
//!         },
//!     )
//!     .await
//! }
//!
//! let app = Router::new().route("/count.v1.CountService/CountUp", post(count_up));
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use connectrpc_duplex_core::{
    CompressionEncoding, ContentType, Framing, MessageCodec, Metadata, Protocol, ProtocolAdapter,
    ProtoCodec, ResponseInfo, Status, TrailerPayload,
};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body::Body;
use tracing::{Instrument, debug, info_span, warn};

use crate::conn::{ChannelBody, HandlerConn, lock};
use crate::context::{CallContext, CancelReason};
use crate::duplex::{DuplexStream, Role, StreamConfig};
use crate::error::StreamError;

/// Handler-side view of one call.
///
/// Cloning yields another handle to the same call, so a handler can receive
/// on one task and send on another.
pub struct HandlerStream<Req, Res, C = ProtoCodec> {
    stream: DuplexStream<HandlerConn>,
    shared: Arc<Shared>,
    codec: C,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res, C: Clone> Clone for HandlerStream<Req, Res, C> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            shared: self.shared.clone(),
            codec: self.codec.clone(),
            _marker: PhantomData,
        }
    }
}

/// State the handler and the finishing task share.
struct Shared {
    adapter: &'static dyn ProtocolAdapter,
    base_headers: HeaderMap,
    headers: Mutex<Metadata>,
    trailers: Mutex<Metadata>,
    unary: Mutex<Option<Bytes>>,
}

impl Shared {
    fn head_headers(&self) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        for (name, value) in lock(&self.headers).without_reserved().iter() {
            headers.append(name.clone(), value.clone());
        }
        headers
    }

    /// Send `200 OK` with the response headers unless the head already went
    /// out.
    fn ensure_head(&self, conn: &HandlerConn) {
        if !conn.head_sent() {
            conn.send_head(StatusCode::OK, self.head_headers());
        }
    }
}

impl<Req, Res, C> HandlerStream<Req, Res, C>
where
    C: MessageCodec<Req> + MessageCodec<Res>,
{
    /// Next request message, or `Ok(None)` once the client finished sending.
    pub async fn receive(&self) -> Result<Option<Req>, StreamError> {
        match self.stream.receive().await? {
            Some(data) => Ok(Some(MessageCodec::<Req>::unmarshal(&self.codec, &data)?)),
            None => Ok(None),
        }
    }

    /// Send one response message. The first send also sends the response
    /// head; unary responses are held until the handler returns.
    pub async fn send(&self, message: &Res) -> Result<(), StreamError> {
        let data = MessageCodec::<Res>::marshal(&self.codec, message)?;
        if self.shared.adapter.framing() == Framing::Unary {
            let mut unary = lock(&self.shared.unary);
            if unary.is_some() {
                return Err(Status::internal("unary handler sent more than one response").into());
            }
            *unary = Some(data);
            return Ok(());
        }
        self.shared.ensure_head(self.stream.conn());
        self.stream.send(data).await
    }

    /// Set a trailer sent with the terminal status.
    pub fn set_trailer(&self, key: &str, value: &str) -> Result<(), StreamError> {
        lock(&self.shared.trailers)
            .append(key, value)
            .map_err(StreamError::from)
    }

    /// Set a response header. Fails once the head has been sent.
    pub fn set_response_header(&self, key: &str, value: &str) -> Result<(), StreamError> {
        if self.stream.conn().head_sent() {
            return Err(Status::failed_precondition("response headers already sent").into());
        }
        lock(&self.shared.headers)
            .insert(key, value)
            .map_err(StreamError::from)
    }

    pub fn request_headers(&self) -> Metadata {
        Metadata::new(self.stream.conn().request_headers().clone())
    }

    pub fn protocol(&self) -> Protocol {
        self.stream.protocol()
    }

    /// Resolves when the client went away or the call's deadline passed.
    pub async fn cancelled(&self) -> CancelReason {
        self.stream.context().done().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.stream.context().fired().is_some()
    }

    pub fn context(&self) -> &CallContext {
        self.stream.context()
    }
}

/// Serve one call with `handler`.
///
/// Requests whose content type names no supported protocol, or a codec other
/// than `codec`, get `415 Unsupported Media Type`. Otherwise the handler runs
/// on its own task; its result becomes the terminal status in the
/// protocol's representation.
pub async fn serve_stream<B, Req, Res, C, F, Fut>(
    request: Request<B>,
    codec: C,
    config: StreamConfig,
    handler: F,
) -> Response<ChannelBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
    Req: 'static,
    Res: 'static,
    C: MessageCodec<Req> + MessageCodec<Res> + Clone,
    F: FnOnce(HandlerStream<Req, Res, C>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    let codec_name = MessageCodec::<Req>::name(&codec);
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let protocol = match ContentType::parse(content_type) {
        Ok(parsed) if parsed.codec == codec_name => parsed.protocol,
        _ => {
            debug!(content_type, "rejecting request with unsupported content type");
            return plain_response(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }
    };
    let adapter = protocol.adapter();

    // Errors found before the handler runs become the call's status.
    let mut initial_error = None;
    let timeout = match adapter.parse_timeout(request.headers()) {
        Ok(timeout) => timeout,
        Err(err) => {
            initial_error = Some(Status::invalid_argument(err.to_string()));
            None
        }
    };
    let request_encoding = request
        .headers()
        .get(adapter.encoding_header())
        .and_then(|v| v.to_str().ok());
    if initial_error.is_none() && CompressionEncoding::from_header(request_encoding).is_none() {
        initial_error = Some(Status::unimplemented(format!(
            "unsupported compression {:?}",
            request_encoding.unwrap_or_default()
        )));
    }

    let accept = request
        .headers()
        .get(adapter.accept_encoding_header())
        .and_then(|v| v.to_str().ok());
    let send_encoding = CompressionEncoding::negotiate(accept, config.compression.encoding);
    let mut config = config;
    config.compression.encoding = send_encoding;

    let accept_header = CompressionEncoding::accept_header();
    let info = ResponseInfo {
        codec: codec_name,
        send_encoding,
        accept_encoding: accept_header.as_deref(),
    };
    let base_headers = match adapter.response_headers(&info) {
        Ok(headers) => headers,
        Err(err) => {
            warn!(error = %err, "building response headers failed");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let span = info_span!(
        "rpc.handle",
        rpc.method = %request.uri().path(),
        rpc.protocol = %protocol,
        rpc.codec = %codec_name,
        otel.kind = "server",
    );
    let (conn, head_rx, body) = HandlerConn::start(request, config.buffer, span.clone());
    let mut ctx = CallContext::with_cancellation(conn.peer_gone().child_token());
    if let Some(timeout) = timeout {
        ctx = ctx.with_timeout(timeout);
    }

    let stream = DuplexStream::new(
        conn,
        protocol,
        Role::Handler,
        codec_name,
        config,
        ctx,
        span.clone(),
    );
    let shared = Arc::new(Shared {
        adapter,
        base_headers,
        headers: Mutex::new(Metadata::default()),
        trailers: Mutex::new(Metadata::default()),
        unary: Mutex::new(None),
    });
    let handler_stream = HandlerStream {
        stream: stream.clone(),
        shared: shared.clone(),
        codec,
        _marker: PhantomData,
    };

    tokio::spawn(
        async move {
            let result = match initial_error {
                Some(status) => Err(status),
                None => match tokio::spawn(handler(handler_stream)).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(error = %err, "handler task failed");
                        Err(Status::internal("handler failed"))
                    }
                },
            };
            finish(&stream, &shared, result).await;
        }
        .instrument(span),
    );

    match head_rx.await {
        Ok(parts) => Response::from_parts(parts, body),
        // The call was torn down before anything could be sent.
        Err(_) => plain_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn plain_response(status: StatusCode) -> Response<ChannelBody> {
    let mut response = Response::new(ChannelBody::empty());
    *response.status_mut() = status;
    response
}

/// Write the terminal status for `result` and close the stream.
async fn finish(
    stream: &DuplexStream<HandlerConn>,
    shared: &Shared,
    result: Result<(), Status>,
) {
    let conn = stream.conn();
    let mut error = result.err();
    let message = lock(&shared.unary).take();
    if shared.adapter.framing() == Framing::Unary && error.is_none() && message.is_none() {
        error = Some(Status::internal("unary handler returned without a response"));
    }
    if let Some(status) = &error {
        debug!(code = %status.code(), "handler finished with error");
    }

    let trailers = lock(&shared.trailers).clone();
    let written = match shared.adapter.wrap_error(error.as_ref(), &trailers) {
        Ok(TrailerPayload::Unary {
            status,
            headers,
            body,
        }) => {
            let mut head = shared.head_headers();
            let body = match (&error, message) {
                (None, Some(message)) => match stream.encode_unary(message) {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(error = %err, "encoding unary response failed");
                        Bytes::new()
                    }
                },
                _ => {
                    head.remove(shared.adapter.encoding_header());
                    body
                }
            };
            for (name, value) in headers.iter() {
                if name == CONTENT_TYPE {
                    head.insert(name.clone(), value.clone());
                } else {
                    head.append(name.clone(), value.clone());
                }
            }
            conn.send_head(status, head);
            stream
                .write_terminal(TrailerPayload::Unary {
                    status,
                    headers: HeaderMap::new(),
                    body,
                })
                .await
        }
        Ok(TrailerPayload::Trailers(status_trailers)) if !conn.head_sent() => {
            // Nothing was sent: answer trailers-only.
            let mut head = shared.head_headers();
            head.extend(status_trailers);
            conn.send_head(StatusCode::OK, head);
            stream.close_send();
            Ok(())
        }
        Ok(payload) => {
            shared.ensure_head(conn);
            stream.write_terminal(payload).await
        }
        Err(err) => {
            warn!(error = %err, "encoding terminal status failed");
            Err(err.into())
        }
    };
    if let Err(err) = written {
        debug!(error = %err, "terminal status not delivered");
    }
    if let Err(err) = stream.close().await {
        debug!(error = %err, "stream closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use connectrpc_duplex_core::{Code, encode_frame, flags};
    use http_body_util::{BodyExt, Full};

    fn request(content_type: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/test.v1.Echo/Echo")
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body))
            .unwrap()
    }

    async fn collect(response: Response<ChannelBody>) -> (Bytes, Option<HeaderMap>) {
        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned();
        (collected.to_bytes(), trailers)
    }

    fn echo_bytes() -> JsonEcho {
        JsonEcho
    }

    /// Codec over raw bytes so the tests need no message types.
    #[derive(Clone, Copy)]
    struct JsonEcho;

    impl MessageCodec<Vec<u8>> for JsonEcho {
        fn name(&self) -> &'static str {
            "proto"
        }

        fn marshal(&self, message: &Vec<u8>) -> Result<Bytes, Status> {
            Ok(Bytes::copy_from_slice(message))
        }

        fn unmarshal(&self, data: &[u8]) -> Result<Vec<u8>, Status> {
            Ok(data.to_vec())
        }
    }

    async fn echo(stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>) -> Result<(), Status> {
        stream.set_trailer("x-handled", "yes").map_err(Status::from)?;
        while let Some(message) = stream.receive().await.map_err(Status::from)? {
            stream.send(&message).await.map_err(Status::from)?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_content_type_is_415() {
        let response = serve_stream(
            request("text/plain", Bytes::new()),
            echo_bytes(),
            StreamConfig::default(),
            echo,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_codec_mismatch_is_415() {
        let response = serve_stream(
            request("application/grpc+json", Bytes::new()),
            echo_bytes(),
            StreamConfig::default(),
            echo,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_grpc_echo_with_trailers() {
        let body = encode_frame(b"ping", 0).unwrap();
        let response = serve_stream(
            request("application/grpc", body),
            echo_bytes(),
            StreamConfig::default(),
            echo,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/grpc+proto");

        let (data, trailers) = collect(response).await;
        assert_eq!(data, encode_frame(b"ping", 0).unwrap());
        let trailers = trailers.unwrap();
        assert_eq!(trailers["grpc-status"], "0");
        assert_eq!(trailers["x-handled"], "yes");
    }

    #[tokio::test]
    async fn test_grpc_error_without_messages_is_trailers_only() {
        let response = serve_stream(
            request("application/grpc", Bytes::new()),
            echo_bytes(),
            StreamConfig::default(),
            |_stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move {
                Err(Status::not_found("nothing here"))
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "5");
        assert_eq!(response.headers()["grpc-message"], "nothing here");
        let (data, trailers) = collect(response).await;
        assert!(data.is_empty());
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn test_grpc_web_trailer_frame() {
        let body = encode_frame(b"ping", 0).unwrap();
        let response = serve_stream(
            request("application/grpc-web+proto", body),
            echo_bytes(),
            StreamConfig::default(),
            echo,
        )
        .await;
        let (data, trailers) = collect(response).await;
        assert!(trailers.is_none());
        let message = encode_frame(b"ping", 0).unwrap();
        assert_eq!(&data[..message.len()], &message[..]);
        let trailer = &data[message.len()..];
        assert_eq!(trailer[0], flags::GRPC_WEB_TRAILER);
        let block = std::str::from_utf8(&trailer[5..]).unwrap();
        assert!(block.contains("grpc-status: 0"));
        assert!(block.contains("x-handled: yes"));
    }

    #[tokio::test]
    async fn test_connect_stream_end_frame() {
        let body = encode_frame(b"ping", 0).unwrap();
        let response = serve_stream(
            request("application/connect+proto", body),
            echo_bytes(),
            StreamConfig::default(),
            |stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move {
                stream.receive().await.map_err(Status::from)?;
                Err(Status::permission_denied("denied"))
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let (data, _) = collect(response).await;
        assert_eq!(data[0], flags::CONNECT_END_STREAM);
        let end: serde_json::Value = serde_json::from_slice(&data[5..]).unwrap();
        assert_eq!(end["error"]["code"], "permission_denied");
        assert_eq!(end["error"]["message"], "denied");
    }

    #[tokio::test]
    async fn test_connect_unary_success_and_trailers() {
        let response = serve_stream(
            request("application/proto", Bytes::from_static(b"ping")),
            echo_bytes(),
            StreamConfig::default(),
            echo,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/proto");
        assert_eq!(response.headers()["trailer-x-handled"], "yes");
        let (data, _) = collect(response).await;
        assert_eq!(data, "ping");
    }

    #[tokio::test]
    async fn test_connect_unary_error_uses_http_status() {
        let response = serve_stream(
            request("application/proto", Bytes::from_static(b"ping")),
            echo_bytes(),
            StreamConfig::default(),
            |_stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move {
                Err(Status::not_found("missing"))
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let (data, _) = collect(response).await;
        let error = Status::from_json(&data, Code::Unknown);
        assert_eq!(error.code(), Code::NotFound);
        assert_eq!(error.message(), Some("missing"));
    }

    #[tokio::test]
    async fn test_unary_without_response_is_internal() {
        let response = serve_stream(
            request("application/proto", Bytes::from_static(b"ping")),
            echo_bytes(),
            StreamConfig::default(),
            |_stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move { Ok(()) },
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_timeout_skips_handler() {
        let request = Request::builder()
            .method("POST")
            .uri("/test.v1.Echo/Echo")
            .header(CONTENT_TYPE, "application/grpc")
            .header("grpc-timeout", "soon")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let response = serve_stream(
            request,
            echo_bytes(),
            StreamConfig::default(),
            move |_stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert_eq!(response.headers()["grpc-status"], "3");
        let (data, _) = collect(response).await;
        assert!(data.is_empty());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unsupported_request_compression() {
        let request = Request::builder()
            .method("POST")
            .uri("/test.v1.Echo/Echo")
            .header(CONTENT_TYPE, "application/grpc-web+proto")
            .header("grpc-encoding", "snappy")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = serve_stream(request, echo_bytes(), StreamConfig::default(), echo).await;
        let (data, _) = collect(response).await;
        let block = std::str::from_utf8(&data[5..]).unwrap();
        assert!(block.contains("grpc-status: 12"));
    }

    #[tokio::test]
    async fn test_response_headers_before_first_send() {
        let body = encode_frame(b"ping", 0).unwrap();
        let response = serve_stream(
            request("application/grpc", body),
            echo_bytes(),
            StreamConfig::default(),
            |stream: HandlerStream<Vec<u8>, Vec<u8>, JsonEcho>| async move {
                stream
                    .set_response_header("x-server", "duplex")
                    .map_err(Status::from)?;
                assert!(stream.request_headers().contains("content-type"));
                let message = stream.receive().await.map_err(Status::from)?.unwrap_or_default();
                stream.send(&message).await.map_err(Status::from)?;
                assert!(stream.set_response_header("x-late", "no").is_err());
                Ok(())
            },
        )
        .await;
        assert_eq!(response.headers()["x-server"], "duplex");
        assert!(response.headers().get("x-late").is_none());
        let (_, trailers) = collect(response).await;
        assert_eq!(trailers.unwrap()["grpc-status"], "0");
    }
}
