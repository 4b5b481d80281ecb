//! Message serialization.
//!
//! The stream engine moves opaque bytes; a [`MessageCodec`] turns them into
//! typed messages at the edges. The codec name is the suffix negotiated in the
//! content type (`application/grpc+proto`, `application/connect+json`, ...).

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::Status;

/// Serializes messages of type `T`.
pub trait MessageCodec<T>: Send + Sync + 'static {
    /// Name used in the content type.
    fn name(&self) -> &'static str;

    fn marshal(&self, message: &T) -> Result<Bytes, Status>;

    fn unmarshal(&self, data: &[u8]) -> Result<T, Status>;
}

/// Protobuf binary encoding via prost.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl<T> MessageCodec<T> for ProtoCodec
where
    T: prost::Message + Default,
{
    fn name(&self) -> &'static str {
        "proto"
    }

    fn marshal(&self, message: &T) -> Result<Bytes, Status> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<T, Status> {
        T::decode(data)
            .map_err(|e| Status::invalid_argument(format!("failed to decode proto message: {e}")))
    }
}

/// JSON encoding via serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> MessageCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, message: &T) -> Result<Bytes, Status> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| Status::internal(format!("failed to encode json message: {e}")))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<T, Status> {
        serde_json::from_slice(data)
            .map_err(|e| Status::invalid_argument(format!("failed to decode json message: {e}")))
    }
}
