use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    CallInfo, EndOfStream, FrameKind, Framing, Protocol, ProtocolAdapter, ResponseInfo,
    TrailerPayload, UnaryResponse, common_headers, insert_header,
};
use crate::envelope::{encode_frame, flags};
use crate::error::{Code, EnvelopeError, ErrorResponseBody, ProtocolError, Status};
use crate::metadata::{Metadata, is_reserved_header};

const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
const TIMEOUT_HEADER: &str = "connect-timeout-ms";
const TRAILER_PREFIX: &str = "trailer-";

/// Largest value `connect-timeout-ms` may carry (ten digits).
const MAX_TIMEOUT_MS: u128 = 9_999_999_999;

/// Body of the Connect end-of-stream frame.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EndStreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponseBody>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, Vec<String>>,
}

fn status_from_body(body: ErrorResponseBody) -> Status {
    let mut status = match body.message {
        Some(message) => Status::new(body.code, message),
        None => Status::from_code(body.code),
    };
    for detail in body.details {
        status = status.add_error_detail(detail);
    }
    status
}

fn connect_headers(
    adapter: &dyn ProtocolAdapter,
    call: &CallInfo<'_>,
) -> Result<HeaderMap, ProtocolError> {
    let mut headers = common_headers(adapter, call.codec, call.send_encoding, call.accept_encoding)?;
    headers.insert(PROTOCOL_VERSION_HEADER, HeaderValue::from_static("1"));
    if let Some(timeout) = call.timeout {
        let millis = timeout.as_millis().clamp(1, MAX_TIMEOUT_MS);
        insert_header(&mut headers, TIMEOUT_HEADER, &millis.to_string())?;
    }
    Ok(headers)
}

fn parse_connect_timeout(headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let invalid = || ProtocolError::InvalidHeader(TIMEOUT_HEADER.into());
    let text = value.to_str().map_err(|_| invalid())?.trim();
    if text.is_empty() || text.len() > 10 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let millis: u64 = text.parse().map_err(|_| invalid())?;
    Ok(Some(Duration::from_millis(millis)))
}

/// Connect streaming: the status travels in a JSON frame flagged `0x02`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectStreamAdapter;

impl ProtocolAdapter for ConnectStreamAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::ConnectStream
    }

    fn allowed_flags(&self) -> u8 {
        flags::COMPRESSED | flags::CONNECT_END_STREAM
    }

    fn classify(&self, frame_flags: u8) -> Result<FrameKind, EnvelopeError> {
        if frame_flags & !self.allowed_flags() != 0 {
            return Err(EnvelopeError::MalformedFrame(frame_flags));
        }
        let compressed = frame_flags & flags::COMPRESSED != 0;
        if frame_flags & flags::CONNECT_END_STREAM != 0 {
            Ok(FrameKind::Trailer { compressed })
        } else {
            Ok(FrameKind::Message { compressed })
        }
    }

    fn encoding_header(&self) -> &'static str {
        "connect-content-encoding"
    }

    fn accept_encoding_header(&self) -> &'static str {
        "connect-accept-encoding"
    }

    fn request_headers(&self, call: &CallInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        connect_headers(self, call)
    }

    fn response_headers(&self, info: &ResponseInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        common_headers(self, info.codec, info.send_encoding, info.accept_encoding)
    }

    fn parse_timeout(&self, headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError> {
        parse_connect_timeout(headers)
    }

    fn wrap_error(
        &self,
        error: Option<&Status>,
        trailers: &Metadata,
    ) -> Result<TrailerPayload, ProtocolError> {
        let mut metadata = trailers.without_reserved();
        if let Some(status) = error {
            metadata.extend(&status.metadata().without_reserved());
        }
        let message = EndStreamMessage {
            error: error.map(|status| ErrorResponseBody {
                code: status.code(),
                message: status.message().map(str::to_string),
                details: status.details().to_vec(),
            }),
            metadata: metadata.to_json_map(),
        };
        let json = serde_json::to_vec(&message)
            .map_err(|e| ProtocolError::MalformedTrailers(e.to_string()))?;
        let frame = encode_frame(&json, flags::CONNECT_END_STREAM)
            .map_err(|e| ProtocolError::MalformedTrailers(e.to_string()))?;
        Ok(TrailerPayload::Frame(frame))
    }

    fn unwrap_trailer_frame(&self, payload: &[u8]) -> Result<EndOfStream, ProtocolError> {
        let message: EndStreamMessage = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::MalformedTrailers(format!("end-of-stream message: {e}")))?;
        let trailers = Metadata::from_json_map(&message.metadata);
        let error = message
            .error
            .filter(|body| body.code != Code::Ok)
            .map(|body| status_from_body(body).with_metadata(trailers.clone()));
        Ok(EndOfStream { error, trailers })
    }

    fn unwrap_trailers(
        &self,
        status: StatusCode,
        _headers: &HeaderMap,
        _trailers: Option<&HeaderMap>,
    ) -> Result<EndOfStream, ProtocolError> {
        if status != StatusCode::OK {
            return Err(ProtocolError::HttpStatus(status.as_u16()));
        }
        Err(ProtocolError::UnexpectedStreamEnd(
            "missing end-of-stream message".into(),
        ))
    }
}

/// Connect unary: no envelopes; errors use the HTTP status and a JSON body,
/// trailers travel as `trailer-` prefixed headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectUnaryAdapter;

impl ProtocolAdapter for ConnectUnaryAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::ConnectUnary
    }

    fn framing(&self) -> Framing {
        Framing::Unary
    }

    fn allowed_flags(&self) -> u8 {
        0
    }

    fn classify(&self, frame_flags: u8) -> Result<FrameKind, EnvelopeError> {
        Err(EnvelopeError::MalformedFrame(frame_flags))
    }

    fn encoding_header(&self) -> &'static str {
        "content-encoding"
    }

    fn accept_encoding_header(&self) -> &'static str {
        "accept-encoding"
    }

    fn request_headers(&self, call: &CallInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        connect_headers(self, call)
    }

    fn response_headers(&self, info: &ResponseInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        common_headers(self, info.codec, info.send_encoding, info.accept_encoding)
    }

    fn parse_timeout(&self, headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError> {
        parse_connect_timeout(headers)
    }

    fn validate_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        codec: &str,
    ) -> Result<(), ProtocolError> {
        // error bodies are always JSON, whatever the codec
        if status != StatusCode::OK {
            return Ok(());
        }
        super::check_content_type(self.protocol(), headers, codec)
    }

    fn wrap_error(
        &self,
        error: Option<&Status>,
        trailers: &Metadata,
    ) -> Result<TrailerPayload, ProtocolError> {
        let mut headers = HeaderMap::new();
        for (name, value) in trailers.without_reserved().iter() {
            let prefixed = format!("{TRAILER_PREFIX}{}", name.as_str());
            let name = HeaderName::from_bytes(prefixed.as_bytes())
                .map_err(|_| ProtocolError::InvalidHeader(prefixed.clone()))?;
            headers.append(name, value.clone());
        }

        let Some(status) = error else {
            return Ok(TrailerPayload::Unary {
                status: StatusCode::OK,
                headers,
                body: Bytes::new(),
            });
        };

        for (name, value) in status.metadata().without_reserved().iter() {
            headers.append(name.clone(), value.clone());
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(status)
            .map_err(|e| ProtocolError::MalformedTrailers(e.to_string()))?;
        Ok(TrailerPayload::Unary {
            status: status.code().http_status(),
            headers,
            body: Bytes::from(body),
        })
    }

    fn unwrap_trailer_frame(&self, _payload: &[u8]) -> Result<EndOfStream, ProtocolError> {
        Err(ProtocolError::MalformedTrailers(
            "connect unary responses carry no trailer frames".into(),
        ))
    }

    fn unwrap_trailers(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        _trailers: Option<&HeaderMap>,
    ) -> Result<EndOfStream, ProtocolError> {
        if status != StatusCode::OK {
            return Err(ProtocolError::HttpStatus(status.as_u16()));
        }
        Ok(EndOfStream {
            error: None,
            trailers: prefixed_trailers(headers),
        })
    }

    fn unwrap_unary(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UnaryResponse, ProtocolError> {
        let trailers = prefixed_trailers(headers);
        if status == StatusCode::OK {
            return Ok(UnaryResponse {
                message: Some(body),
                end: EndOfStream {
                    error: None,
                    trailers,
                },
            });
        }

        let mut metadata = Metadata::default();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if !is_reserved_header(name) && !name.starts_with(TRAILER_PREFIX) {
                let _ = metadata.append(name, value.to_str().unwrap_or_default());
            }
        }
        metadata.extend(&trailers);
        let error = Status::from_json(&body, Code::from_http_status(status)).with_metadata(metadata);
        Ok(UnaryResponse {
            message: None,
            end: EndOfStream {
                error: Some(error),
                trailers,
            },
        })
    }
}

fn prefixed_trailers(headers: &HeaderMap) -> Metadata {
    let mut trailers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let Some(stripped) = name.as_str().strip_prefix(TRAILER_PREFIX) {
            if let Ok(name) = HeaderName::from_bytes(stripped.as_bytes()) {
                trailers.append(name, value.clone());
            }
        }
    }
    Metadata::new(trailers)
}
