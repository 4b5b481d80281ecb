use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};

use super::grpc::{
    GRPC_STATUS, GRPC_TIMEOUT, encode_timeout, parse_timeout_header, status_from_headers,
    status_to_headers, validate_grpc_response,
};
use super::{
    CallInfo, EndOfStream, FrameKind, Protocol, ProtocolAdapter, ResponseInfo, TrailerPayload,
    common_headers, insert_header,
};
use crate::envelope::{encode_frame, flags};
use crate::error::{EnvelopeError, ProtocolError, Status};
use crate::metadata::Metadata;

/// gRPC-Web: the status travels in a body frame flagged `0x80` whose payload
/// is an HTTP/1-style header block.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcWebAdapter;

impl ProtocolAdapter for GrpcWebAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::GrpcWeb
    }

    fn allowed_flags(&self) -> u8 {
        flags::COMPRESSED | flags::GRPC_WEB_TRAILER
    }

    fn classify(&self, frame_flags: u8) -> Result<FrameKind, EnvelopeError> {
        if frame_flags & !self.allowed_flags() != 0 {
            return Err(EnvelopeError::MalformedFrame(frame_flags));
        }
        let compressed = frame_flags & flags::COMPRESSED != 0;
        if frame_flags & flags::GRPC_WEB_TRAILER != 0 {
            Ok(FrameKind::Trailer { compressed })
        } else {
            Ok(FrameKind::Message { compressed })
        }
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
        headers.insert("x-grpc-web", HeaderValue::from_static("1"));
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
        let block = encode_header_block(&status_to_headers(error, trailers));
        let frame = encode_frame(&block, flags::GRPC_WEB_TRAILER)
            .map_err(|e| ProtocolError::MalformedTrailers(e.to_string()))?;
        Ok(TrailerPayload::Frame(frame))
    }

    fn unwrap_trailer_frame(&self, payload: &[u8]) -> Result<EndOfStream, ProtocolError> {
        let headers = parse_header_block(payload)?;
        status_from_headers(&headers)
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
        if headers.contains_key(GRPC_STATUS) {
            return status_from_headers(headers);
        }
        if status != StatusCode::OK {
            return Err(ProtocolError::HttpStatus(status.as_u16()));
        }
        Err(ProtocolError::UnexpectedStreamEnd(
            "missing grpc-web trailer frame".into(),
        ))
    }
}

fn encode_header_block(headers: &HeaderMap) -> Bytes {
    let mut block = Vec::new();
    for (name, value) in headers.iter() {
        block.extend_from_slice(name.as_str().as_bytes());
        block.extend_from_slice(b": ");
        block.extend_from_slice(value.as_bytes());
        block.extend_from_slice(b"\r\n");
    }
    Bytes::from(block)
}

fn parse_header_block(payload: &[u8]) -> Result<HeaderMap, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ProtocolError::MalformedTrailers("trailer block is not utf-8".into()))?;
    let mut headers = HeaderMap::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedTrailers(format!("invalid line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
            .map_err(|_| ProtocolError::MalformedTrailers(format!("invalid name {name:?}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ProtocolError::MalformedTrailers(format!("invalid value for {name}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}
