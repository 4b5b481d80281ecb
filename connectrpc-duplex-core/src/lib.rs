//! Wire-level building blocks for the connectrpc-duplex stream engine.
//!
//! ## Modules
//!
//! - [`error`]: Status codes, [`Status`] and framing/protocol errors
//! - [`envelope`]: Length-prefixed frame encoding and decoding
//! - [`compression`]: Per-message compression
//! - [`codec`]: Message serialization
//! - [`metadata`]: Header and trailer metadata
//! - [`protocol`]: Connect, gRPC and gRPC-Web adapters

pub mod codec;
pub mod compression;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod protocol;

pub use codec::{JsonCodec, MessageCodec, ProtoCodec};
pub use compression::*;
pub use envelope::{Envelope, EnvelopeCodec, HEADER_SIZE, decode_frame, encode_frame, flags};
pub use error::*;
pub use metadata::{Metadata, is_reserved_header};
pub use protocol::{
    CallInfo, ContentType, EndOfStream, FrameKind, Framing, Protocol, ProtocolAdapter,
    ResponseInfo, TrailerPayload, UnaryResponse,
};
