//! Protocol adapters.
//!
//! Connect, gRPC and gRPC-Web share envelope framing but disagree on how a
//! stream ends: gRPC puts the status in HTTP trailers, gRPC-Web in a trailer
//! frame flagged `0x80`, Connect streaming in a JSON end-of-stream frame and
//! Connect unary in the HTTP status and body. A [`ProtocolAdapter`] captures
//! those differences so the stream engine never branches on the protocol.

mod connect;
mod grpc;
mod grpc_web;

use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};

use crate::compression::CompressionEncoding;
use crate::error::{EnvelopeError, ProtocolError, Status};
use crate::metadata::Metadata;

pub use connect::{ConnectStreamAdapter, ConnectUnaryAdapter};
pub use grpc::GrpcAdapter;
pub use grpc_web::GrpcWebAdapter;

/// Wire protocols understood by the stream engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    /// Connect protocol for unary calls: one message, no envelopes.
    ConnectUnary,
    /// Connect protocol for streaming calls.
    ConnectStream,
}

impl Protocol {
    /// The adapter implementing this protocol.
    pub fn adapter(self) -> &'static dyn ProtocolAdapter {
        match self {
            Protocol::Grpc => &GrpcAdapter,
            Protocol::GrpcWeb => &GrpcWebAdapter,
            Protocol::ConnectUnary => &ConnectUnaryAdapter,
            Protocol::ConnectStream => &ConnectStreamAdapter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc-web",
            Protocol::ConnectUnary => "connect-unary",
            Protocol::ConnectStream => "connect-stream",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How messages are laid out in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Length-prefixed envelopes.
    Enveloped,
    /// The whole body is a single message.
    Unary,
}

/// Classification of a received envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message { compressed: bool },
    Trailer { compressed: bool },
}

/// A parsed content type: protocol plus codec name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub protocol: Protocol,
    pub codec: String,
}

impl ContentType {
    pub fn new(protocol: Protocol, codec: impl Into<String>) -> Self {
        Self {
            protocol,
            codec: codec.into(),
        }
    }

    /// Parse a `content-type` header value.
    ///
    /// ```
    /// use connectrpc_duplex_core::{ContentType, Protocol};
    ///
    /// let ct = ContentType::parse("application/grpc").unwrap();
    /// assert_eq!(ct, ContentType::new(Protocol::Grpc, "proto"));
    ///
    /// let ct = ContentType::parse("application/connect+json; charset=utf-8").unwrap();
    /// assert_eq!(ct, ContentType::new(Protocol::ConnectStream, "json"));
    /// ```
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let unsupported = || ProtocolError::UnsupportedProtocol(value.to_string());
        let essence = value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let subtype = essence.strip_prefix("application/").ok_or_else(unsupported)?;

        let (protocol, codec) = if let Some(rest) = subtype.strip_prefix("grpc-web") {
            (Protocol::GrpcWeb, grpc_codec_suffix(rest))
        } else if let Some(rest) = subtype.strip_prefix("grpc") {
            (Protocol::Grpc, grpc_codec_suffix(rest))
        } else if let Some(codec) = subtype.strip_prefix("connect+") {
            (Protocol::ConnectStream, Some(codec))
        } else if subtype.contains('+') || subtype == "connect" {
            return Err(unsupported());
        } else {
            (Protocol::ConnectUnary, Some(subtype))
        };

        match codec {
            Some(codec) if !codec.is_empty() => Ok(ContentType::new(protocol, codec)),
            _ => Err(unsupported()),
        }
    }

    /// Render as a `content-type` header value.
    pub fn header_value(&self) -> String {
        match self.protocol {
            Protocol::Grpc => format!("application/grpc+{}", self.codec),
            Protocol::GrpcWeb => format!("application/grpc-web+{}", self.codec),
            Protocol::ConnectStream => format!("application/connect+{}", self.codec),
            Protocol::ConnectUnary => format!("application/{}", self.codec),
        }
    }
}

fn grpc_codec_suffix(rest: &str) -> Option<&str> {
    if rest.is_empty() {
        Some("proto")
    } else {
        rest.strip_prefix('+')
    }
}

/// What the client knows when it opens a call.
#[derive(Debug, Clone)]
pub struct CallInfo<'a> {
    pub codec: &'a str,
    pub timeout: Option<Duration>,
    pub send_encoding: CompressionEncoding,
    pub accept_encoding: Option<&'a str>,
}

/// What the handler knows when it answers a call.
#[derive(Debug, Clone)]
pub struct ResponseInfo<'a> {
    pub codec: &'a str,
    pub send_encoding: CompressionEncoding,
    pub accept_encoding: Option<&'a str>,
}

/// Terminal outcome of a stream as reported by the peer.
#[derive(Debug, Clone, Default)]
pub struct EndOfStream {
    pub error: Option<Status>,
    pub trailers: Metadata,
}

/// Carrier for the terminal status on the sending side.
#[derive(Debug, Clone)]
pub enum TrailerPayload {
    /// A fully encoded envelope written as the last frame of the body.
    Frame(Bytes),
    /// HTTP trailers sent after the body.
    Trailers(HeaderMap),
    /// Everything travels in the response head and body.
    Unary {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

/// A unary response body split into its message and terminal outcome.
#[derive(Debug, Clone)]
pub struct UnaryResponse {
    pub message: Option<Bytes>,
    pub end: EndOfStream,
}

/// Per-protocol encoding and decoding of headers, trailers and errors.
pub trait ProtocolAdapter: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    fn framing(&self) -> Framing {
        Framing::Enveloped
    }

    /// Flag bits a received envelope may carry.
    fn allowed_flags(&self) -> u8;

    /// Tell message frames from trailer frames.
    fn classify(&self, flags: u8) -> Result<FrameKind, EnvelopeError>;

    /// Header naming the encoding of the message payloads.
    fn encoding_header(&self) -> &'static str;

    /// Header listing the encodings the sender accepts.
    fn accept_encoding_header(&self) -> &'static str;

    fn request_headers(&self, call: &CallInfo<'_>) -> Result<HeaderMap, ProtocolError>;

    fn response_headers(&self, info: &ResponseInfo<'_>) -> Result<HeaderMap, ProtocolError>;

    /// Read the call timeout announced by the client.
    fn parse_timeout(&self, headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError>;

    /// Check the response head before any frame is read.
    fn validate_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        codec: &str,
    ) -> Result<(), ProtocolError> {
        if status != StatusCode::OK {
            return Err(ProtocolError::HttpStatus(status.as_u16()));
        }
        check_content_type(self.protocol(), headers, codec)
    }

    /// Encode the terminal status (`None` for success) and trailers.
    fn wrap_error(
        &self,
        error: Option<&Status>,
        trailers: &Metadata,
    ) -> Result<TrailerPayload, ProtocolError>;

    /// Decode the payload of a frame classified as [`FrameKind::Trailer`].
    fn unwrap_trailer_frame(&self, payload: &[u8]) -> Result<EndOfStream, ProtocolError>;

    /// Decode the terminal outcome once the body ended without a trailer
    /// frame. Reports [`ProtocolError::UnexpectedStreamEnd`] when neither the
    /// headers nor the trailers carry one.
    fn unwrap_trailers(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        trailers: Option<&HeaderMap>,
    ) -> Result<EndOfStream, ProtocolError>;

    /// Split a unary response body into its message and outcome.
    fn unwrap_unary(
        &self,
        _status: StatusCode,
        _headers: &HeaderMap,
        _body: Bytes,
    ) -> Result<UnaryResponse, ProtocolError> {
        Err(ProtocolError::UnsupportedProtocol(format!(
            "{} does not use unary framing",
            self.protocol()
        )))
    }
}

pub(crate) fn check_content_type(
    protocol: Protocol,
    headers: &HeaderMap,
    codec: &str,
) -> Result<(), ProtocolError> {
    let value = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let parsed = ContentType::parse(value)?;
    if parsed.protocol != protocol || parsed.codec != codec {
        return Err(ProtocolError::UnsupportedProtocol(value.to_string()));
    }
    Ok(())
}

pub(crate) fn insert_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), ProtocolError> {
    let value = http::HeaderValue::from_str(value)
        .map_err(|_| ProtocolError::InvalidHeader(name.to_string()))?;
    headers.insert(name, value);
    Ok(())
}

/// Insert the content type and the encoding headers shared by every protocol.
pub(crate) fn common_headers(
    adapter: &dyn ProtocolAdapter,
    codec: &str,
    send_encoding: CompressionEncoding,
    accept_encoding: Option<&str>,
) -> Result<HeaderMap, ProtocolError> {
    let mut headers = HeaderMap::new();
    let content_type = ContentType::new(adapter.protocol(), codec).header_value();
    insert_header(&mut headers, "content-type", &content_type)?;
    if !send_encoding.is_identity() {
        insert_header(&mut headers, adapter.encoding_header(), send_encoding.as_str())?;
    }
    if let Some(accept) = accept_encoding {
        insert_header(&mut headers, adapter.accept_encoding_header(), accept)?;
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_types() {
        let cases = [
            ("application/grpc", Protocol::Grpc, "proto"),
            ("application/grpc+json", Protocol::Grpc, "json"),
            ("application/grpc-web", Protocol::GrpcWeb, "proto"),
            ("application/grpc-web+proto", Protocol::GrpcWeb, "proto"),
            ("application/connect+proto", Protocol::ConnectStream, "proto"),
            ("application/json; charset=utf-8", Protocol::ConnectUnary, "json"),
            ("Application/Proto", Protocol::ConnectUnary, "proto"),
        ];
        for (value, protocol, codec) in cases {
            assert_eq!(
                ContentType::parse(value).unwrap(),
                ContentType::new(protocol, codec),
                "{value}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_unknown_content_types() {
        for value in [
            "text/plain",
            "application/grpc-web-text",
            "application/grpcx",
            "application/connect",
            "application/connect+",
            "application/grpc+",
            "",
        ] {
            assert!(
                matches!(
                    ContentType::parse(value),
                    Err(ProtocolError::UnsupportedProtocol(_))
                ),
                "{value}"
            );
        }
    }

    #[test]
    fn test_header_value() {
        assert_eq!(
            ContentType::new(Protocol::Grpc, "proto").header_value(),
            "application/grpc+proto"
        );
        assert_eq!(
            ContentType::new(Protocol::ConnectUnary, "json").header_value(),
            "application/json"
        );
    }

    #[test]
    fn test_default_validate_response() {
        let adapter = Protocol::ConnectStream.adapter();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/connect+proto".parse().unwrap());

        assert!(adapter.validate_response(StatusCode::OK, &headers, "proto").is_ok());
        assert!(matches!(
            adapter.validate_response(StatusCode::OK, &headers, "json"),
            Err(ProtocolError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            adapter.validate_response(StatusCode::BAD_GATEWAY, &headers, "proto"),
            Err(ProtocolError::HttpStatus(502))
        ));
    }
}
