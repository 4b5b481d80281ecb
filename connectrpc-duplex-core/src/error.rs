//! RPC status codes and error types.
//!
//! This module provides the core error types shared by every protocol:
//! - [`Code`]: Protocol status codes
//! - [`ErrorDetail`]: Self-describing error details
//! - [`Status`]: The terminal result of a failed call
//! - [`EnvelopeError`]: Envelope framing errors
//! - [`ProtocolError`]: Violations of a protocol's response or trailer rules

use std::str::FromStr;

use base64::Engine;
use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::metadata::Metadata;

macro_rules! codes {
    ($($variant:ident = $value:literal => $name:literal,)*) => {
        /// RPC status codes, shared by Connect, gRPC and gRPC-Web.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Code {
            $($variant = $value,)*
        }

        impl Code {
            /// Every code, in numeric order.
            pub const ALL: &'static [Code] = &[$(Code::$variant,)*];

            /// Name used in Connect error bodies and in logs.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Code::$variant => $name,)*
                }
            }

            /// Parse a numeric `grpc-status` value.
            ///
            /// Returns `None` for values outside the defined range; callers
            /// surface those as [`Code::Unknown`].
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $($value => Some(Code::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

codes! {
    Ok = 0 => "ok",
    Canceled = 1 => "canceled",
    Unknown = 2 => "unknown",
    InvalidArgument = 3 => "invalid_argument",
    DeadlineExceeded = 4 => "deadline_exceeded",
    NotFound = 5 => "not_found",
    AlreadyExists = 6 => "already_exists",
    PermissionDenied = 7 => "permission_denied",
    ResourceExhausted = 8 => "resource_exhausted",
    FailedPrecondition = 9 => "failed_precondition",
    Aborted = 10 => "aborted",
    OutOfRange = 11 => "out_of_range",
    Unimplemented = 12 => "unimplemented",
    Internal = 13 => "internal",
    Unavailable = 14 => "unavailable",
    DataLoss = 15 => "data_loss",
    Unauthenticated = 16 => "unauthenticated",
}

impl Code {
    /// The numeric value carried in `grpc-status`.
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// HTTP status used for a Connect unary error response carrying this code.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Code::Ok => StatusCode::OK,
            Code::Canceled => StatusCode::REQUEST_TIMEOUT,
            Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::AlreadyExists => StatusCode::CONFLICT,
            Code::PermissionDenied => StatusCode::FORBIDDEN,
            Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Code::FailedPrecondition => StatusCode::BAD_REQUEST,
            Code::Aborted => StatusCode::CONFLICT,
            Code::OutOfRange => StatusCode::BAD_REQUEST,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        }
    }

    /// Infer a code from an HTTP status when the response carried no
    /// protocol-level status of its own.
    pub fn from_http_status(status: StatusCode) -> Self {
        match status.as_u16() {
            200 => Code::Ok,
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502..=504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A code name that no protocol defines.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown error code {0:?}")]
pub struct ParseCodeError(String);

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // gRPC spells it with two l's.
        if s == "cancelled" {
            return Ok(Code::Canceled);
        }
        Code::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ParseCodeError(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Codes from newer peers degrade to unknown instead of failing the call.
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or(Code::Unknown))
    }
}

/// A self-describing error detail.
///
/// Error details are structured Protobuf messages attached to errors. This
/// maps to `google.protobuf.Any` on the wire.
///
/// # Wire Format
///
/// Connect carries details as JSON objects with `type` and `value` fields:
/// ```json
/// {"type": "google.rpc.RetryInfo", "value": "base64-encoded-protobuf"}
/// ```
/// gRPC and gRPC-Web carry them inside `grpc-status-details-bin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Fully-qualified type name (e.g., "google.rpc.RetryInfo").
    type_url: String,
    /// Protobuf-encoded message bytes.
    value: Vec<u8>,
}

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

impl ErrorDetail {
    /// Create a new error detail with a type URL and protobuf-encoded bytes.
    pub fn new<S: Into<String>>(type_url: S, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// Get the fully-qualified type name.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Type name without the `type.googleapis.com/` prefix.
    pub fn type_name(&self) -> &str {
        self.type_url
            .strip_prefix(TYPE_URL_PREFIX)
            .unwrap_or(&self.type_url)
    }

    /// Get the protobuf-encoded value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Convert into a `google.protobuf.Any`, restoring the type URL prefix.
    pub fn to_any(&self) -> prost_types::Any {
        let type_url = if self.type_url.contains('/') {
            self.type_url.clone()
        } else {
            format!("{TYPE_URL_PREFIX}{}", self.type_url)
        };
        prost_types::Any {
            type_url,
            value: self.value.clone(),
        }
    }

    /// Build a detail from a decoded `google.protobuf.Any`.
    pub fn from_any(any: prost_types::Any) -> Self {
        Self {
            type_url: any.type_url,
            value: any.value,
        }
    }
}

impl Serialize for ErrorDetail {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("ErrorDetail", 2)?;
        s.serialize_field("type", self.type_name())?;

        // Connect uses unpadded base64
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(&self.value);
        s.serialize_field("value", &encoded)?;

        s.end()
    }
}

impl<'de> Deserialize<'de> for ErrorDetail {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct WireDetail {
            #[serde(rename = "type")]
            type_name: String,
            #[serde(default)]
            value: String,
        }

        let wire = WireDetail::deserialize(deserializer)?;
        let value = decode_base64(&wire.value).map_err(serde::de::Error::custom)?;
        Ok(ErrorDetail::new(wire.type_name, value))
    }
}

/// Decode base64 that may or may not carry padding.
pub(crate) fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(value.trim_end_matches('='))
}

/// Envelope framing errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A frame declared a payload larger than the configured limit.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// Flags carried bits the protocol does not allow.
    #[error("invalid frame flags: 0x{0:02x}")]
    MalformedFrame(u8),

    /// The stream ended partway through a frame.
    #[error("unexpected end of stream: expected {expected} bytes, got {actual}")]
    UnexpectedEof { expected: usize, actual: usize },

    /// Compression failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Decompression failed.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Reading from the underlying transport failed.
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EnvelopeError {
    fn from(err: std::io::Error) -> Self {
        EnvelopeError::Io(err.to_string())
    }
}

impl EnvelopeError {
    /// Status code reported to the application for this framing failure.
    pub fn code(&self) -> Code {
        match self {
            EnvelopeError::FrameTooLarge { .. } => Code::ResourceExhausted,
            EnvelopeError::Compression(_) | EnvelopeError::Decompression(_) => Code::Internal,
            EnvelopeError::Io(_) => Code::Unavailable,
            EnvelopeError::MalformedFrame(_) | EnvelopeError::UnexpectedEof { .. } => {
                Code::Internal
            }
        }
    }
}

/// Violations of the response or trailer rules of a protocol.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer answered with a content type no adapter understands.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The body ended without a terminal status.
    #[error("stream ended without a terminal status: {0}")]
    UnexpectedStreamEnd(String),

    /// The terminal trailers could not be parsed.
    #[error("malformed trailers: {0}")]
    MalformedTrailers(String),

    /// The response carried a non-success HTTP status and no RPC status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// A header value could not be encoded.
    #[error("invalid header value for {0}")]
    InvalidHeader(String),
}

impl ProtocolError {
    /// Status code reported to the application for this protocol failure.
    pub fn code(&self) -> Code {
        match self {
            ProtocolError::UnsupportedProtocol(_) => Code::Unknown,
            ProtocolError::UnexpectedStreamEnd(_) | ProtocolError::MalformedTrailers(_) => {
                Code::Internal
            }
            ProtocolError::HttpStatus(status) => StatusCode::from_u16(*status)
                .map(Code::from_http_status)
                .unwrap_or(Code::Unknown),
            ProtocolError::InvalidHeader(_) => Code::Internal,
        }
    }
}

/// JSON body of a Connect error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseBody {
    pub code: Code,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<ErrorDetail>,
}

/// RPC status representing the failure of a call.
///
/// Contains the error code, optional message, optional structured details and
/// the metadata the peer attached to the error.
///
/// # Example
///
/// ```
/// use connectrpc_duplex_core::Status;
///
/// let status = Status::not_found("user not found");
/// assert_eq!(status.code().as_str(), "not_found");
/// assert_eq!(status.message(), Some("user not found"));
///
/// let status = status.add_detail("google.rpc.RetryInfo", vec![1, 2, 3]);
/// assert_eq!(status.details().len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    message: Option<String>,
    details: Vec<ErrorDetail>,
    metadata: Metadata,
}

impl Status {
    /// Create a new status with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: vec![],
            metadata: Metadata::default(),
        }
    }

    /// Create a new status with just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: vec![],
            metadata: Metadata::default(),
        }
    }

    /// Get the error code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the error message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    /// Metadata attached to the error.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Replace the error metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add an error detail with type URL and protobuf-encoded bytes.
    pub fn add_detail<S: Into<String>>(mut self, type_url: S, value: Vec<u8>) -> Self {
        self.details.push(ErrorDetail::new(type_url, value));
        self
    }

    /// Add a pre-constructed ErrorDetail.
    pub fn add_error_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Build a status from a Connect JSON error body.
    ///
    /// Falls back to `fallback` when the body is not a valid error document.
    pub fn from_json(body: &[u8], fallback: Code) -> Self {
        match serde_json::from_slice::<ErrorResponseBody>(body) {
            Ok(parsed) => Status {
                code: parsed.code,
                message: parsed.message,
                details: parsed.details,
                metadata: Metadata::default(),
            },
            Err(_) => Status::from_code(fallback),
        }
    }
}

macro_rules! status_constructors {
    ($($name:ident => $code:ident,)*) => {
        impl Status {
            $(
                #[doc = concat!("A `", stringify!($name), "` status with `message`.")]
                pub fn $name<S: Into<String>>(message: S) -> Self {
                    Self::new(Code::$code, message)
                }
            )*
        }
    };
}

status_constructors! {
    cancelled => Canceled,
    unknown => Unknown,
    invalid_argument => InvalidArgument,
    deadline_exceeded => DeadlineExceeded,
    not_found => NotFound,
    already_exists => AlreadyExists,
    permission_denied => PermissionDenied,
    resource_exhausted => ResourceExhausted,
    failed_precondition => FailedPrecondition,
    aborted => Aborted,
    out_of_range => OutOfRange,
    unimplemented => Unimplemented,
    internal => Internal,
    unavailable => Unavailable,
    data_loss => DataLoss,
    unauthenticated => Unauthenticated,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<EnvelopeError> for Status {
    fn from(err: EnvelopeError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<ProtocolError> for Status {
    fn from(err: ProtocolError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ErrorResponseBody {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
        }
        .serialize(serializer)
    }
}
