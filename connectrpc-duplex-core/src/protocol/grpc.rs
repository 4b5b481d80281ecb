use std::time::Duration;

use base64::Engine;
use http::{HeaderMap, HeaderValue, StatusCode};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode, utf8_percent_encode};
use prost::Message;

use super::{
    CallInfo, EndOfStream, FrameKind, Protocol, ProtocolAdapter, ResponseInfo, TrailerPayload,
    check_content_type, common_headers, insert_header,
};
use crate::envelope::flags;
use crate::error::{Code, EnvelopeError, ErrorDetail, ProtocolError, Status, decode_base64};
use crate::metadata::Metadata;

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
pub(crate) const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";
pub(crate) const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Wire form of `google.rpc.Status`.
#[derive(Clone, PartialEq, Message)]
struct RpcStatus {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// gRPC over HTTP/2: status in real HTTP trailers.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcAdapter;

impl ProtocolAdapter for GrpcAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    fn allowed_flags(&self) -> u8 {
        flags::COMPRESSED
    }

    fn classify(&self, frame_flags: u8) -> Result<FrameKind, EnvelopeError> {
        if frame_flags & !flags::COMPRESSED != 0 {
            return Err(EnvelopeError::MalformedFrame(frame_flags));
        }
        Ok(FrameKind::Message {
            compressed: frame_flags & flags::COMPRESSED != 0,
        })
    }

    fn encoding_header(&self) -> &'static str {
        "grpc-encoding"
    }

    fn accept_encoding_header(&self) -> &'static str {
        "grpc-accept-encoding"
    }

    fn request_headers(&self, call: &CallInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        let mut headers =
            common_headers(self, call.codec, call.send_encoding, call.accept_encoding)?;
        headers.insert("te", HeaderValue::from_static("trailers"));
        if let Some(timeout) = call.timeout {
            insert_header(&mut headers, GRPC_TIMEOUT, &encode_timeout(timeout))?;
        }
        Ok(headers)
    }

    fn response_headers(&self, info: &ResponseInfo<'_>) -> Result<HeaderMap, ProtocolError> {
        common_headers(self, info.codec, info.send_encoding, info.accept_encoding)
    }

    fn parse_timeout(&self, headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError> {
        parse_timeout_header(headers)
    }

    fn validate_response(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        codec: &str,
    ) -> Result<(), ProtocolError> {
        validate_grpc_response(self.protocol(), status, headers, codec)
    }

    fn wrap_error(
        &self,
        error: Option<&Status>,
        trailers: &Metadata,
    ) -> Result<TrailerPayload, ProtocolError> {
        Ok(TrailerPayload::Trailers(status_to_headers(error, trailers)))
    }

    fn unwrap_trailer_frame(&self, _payload: &[u8]) -> Result<EndOfStream, ProtocolError> {
        Err(ProtocolError::MalformedTrailers(
            "grpc does not use trailer frames".into(),
        ))
    }

    fn unwrap_trailers(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        trailers: Option<&HeaderMap>,
    ) -> Result<EndOfStream, ProtocolError> {
        if let Some(trailers) = trailers.filter(|t| t.contains_key(GRPC_STATUS)) {
            return status_from_headers(trailers);
        }
        // trailers-only response
        if headers.contains_key(GRPC_STATUS) {
            return status_from_headers(headers);
        }
        if status != StatusCode::OK {
            return Err(ProtocolError::HttpStatus(status.as_u16()));
        }
        Err(ProtocolError::UnexpectedStreamEnd(
            "missing grpc-status trailer".into(),
        ))
    }
}

/// Accept a trailers-only response even when it omits the content type.
pub(crate) fn validate_grpc_response(
    protocol: Protocol,
    status: StatusCode,
    headers: &HeaderMap,
    codec: &str,
) -> Result<(), ProtocolError> {
    if status != StatusCode::OK {
        return Err(ProtocolError::HttpStatus(status.as_u16()));
    }
    if headers.contains_key(GRPC_STATUS) && !headers.contains_key(http::header::CONTENT_TYPE) {
        return Ok(());
    }
    check_content_type(protocol, headers, codec)
}

/// Render a terminal status as `grpc-*` headers plus application trailers.
pub(crate) fn status_to_headers(error: Option<&Status>, trailers: &Metadata) -> HeaderMap {
    let mut headers = trailers.without_reserved().into_headers();
    let Some(status) = error else {
        headers.insert(GRPC_STATUS, HeaderValue::from(0));
        return headers;
    };

    for (name, value) in status.metadata().without_reserved().iter() {
        headers.append(name.clone(), value.clone());
    }
    headers.insert(GRPC_STATUS, HeaderValue::from(status.code().as_i32()));
    if let Some(message) = status.message().filter(|m| !m.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(&encode_message(message)) {
            headers.insert(GRPC_MESSAGE, value);
        }
    }
    if !status.details().is_empty() {
        let proto = RpcStatus {
            code: status.code().as_i32(),
            message: status.message().unwrap_or_default().to_string(),
            details: status.details().iter().map(ErrorDetail::to_any).collect(),
        };
        let encoded =
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(proto.encode_to_vec());
        if let Ok(value) = HeaderValue::from_str(&encoded) {
            headers.insert(GRPC_STATUS_DETAILS, value);
        }
    }
    headers
}

/// Parse `grpc-status`, `grpc-message` and `grpc-status-details-bin`.
pub(crate) fn status_from_headers(headers: &HeaderMap) -> Result<EndOfStream, ProtocolError> {
    let raw = headers
        .get(GRPC_STATUS)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProtocolError::UnexpectedStreamEnd("missing grpc-status".into()))?;
    let trailers = Metadata::new(headers.clone()).without_reserved();

    let code = raw
        .trim()
        .parse::<i32>()
        .ok()
        .and_then(Code::from_i32)
        .unwrap_or(Code::Unknown);
    if code == Code::Ok {
        return Ok(EndOfStream {
            error: None,
            trailers,
        });
    }

    let message = headers
        .get(GRPC_MESSAGE)
        .map(|v| decode_message(v.as_bytes()));
    let mut status = match message {
        Some(message) => Status::new(code, message),
        None => Status::from_code(code),
    };

    if let Some(value) = headers.get(GRPC_STATUS_DETAILS) {
        let bytes = value
            .to_str()
            .ok()
            .and_then(|v| decode_base64(v).ok())
            .ok_or_else(|| ProtocolError::MalformedTrailers(GRPC_STATUS_DETAILS.into()))?;
        let proto = RpcStatus::decode(bytes.as_slice())
            .map_err(|e| ProtocolError::MalformedTrailers(format!("{GRPC_STATUS_DETAILS}: {e}")))?;
        for any in proto.details {
            status = status.add_error_detail(ErrorDetail::from_any(any));
        }
    }

    Ok(EndOfStream {
        error: Some(status.with_metadata(trailers.clone())),
        trailers,
    })
}

pub(crate) fn parse_timeout_header(headers: &HeaderMap) -> Result<Option<Duration>, ProtocolError> {
    match headers.get(GRPC_TIMEOUT) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(parse_timeout)
            .map(Some)
            .ok_or_else(|| ProtocolError::InvalidHeader(GRPC_TIMEOUT.into())),
    }
}

const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Encode a duration as `grpc-timeout`: at most eight digits and a unit,
/// using the finest unit that fits.
pub(crate) fn encode_timeout(timeout: Duration) -> String {
    let candidates = [
        (timeout.as_nanos(), 'n'),
        (timeout.as_micros(), 'u'),
        (timeout.as_millis(), 'm'),
        (u128::from(timeout.as_secs()), 'S'),
        (u128::from(timeout.as_secs() / 60), 'M'),
    ];
    for (value, unit) in candidates {
        if value <= MAX_TIMEOUT_VALUE {
            return format!("{value}{unit}");
        }
    }
    let hours = (timeout.as_secs() / 3600).min(MAX_TIMEOUT_VALUE as u64);
    format!("{hours}H")
}

pub(crate) fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Bytes escaped in `grpc-message`: everything outside printable ASCII,
/// plus `%` itself. Non-ASCII bytes are always escaped.
const MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Percent-encode a `grpc-message` value.
pub(crate) fn encode_message(message: &str) -> String {
    utf8_percent_encode(message, MESSAGE_ESCAPES).to_string()
}

/// Decode a `grpc-message` value. Malformed escapes pass through untouched
/// and invalid UTF-8 becomes U+FFFD.
pub(crate) fn decode_message(value: &[u8]) -> String {
    percent_decode(value).decode_utf8_lossy().into_owned()
}
