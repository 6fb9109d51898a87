//! Ready-made serialization strategies: protobuf via prost and JSON via
//! serde.
//!
//! The engine only sees the traits from `triwire-core`; these are the
//! implementations generated stubs hand to it. The error-detail parser is
//! shared by both strategies, since detail payloads are protobuf
//! (`google.rpc.Status`) regardless of the message encoding.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use triwire_core::{
    Codec, ConnectError, ErrorDetail, ErrorDetailParser, SerializationStrategy,
};

/// Hand-written mirrors of the well-known types carried by
/// `grpc-status-details-bin`. Code generation is deliberately out of this
/// repo's scope, and these two messages are all it needs.
mod pb {
    /// `google.rpc.Status`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        #[prost(message, repeated, tag = "3")]
        pub details: ::prost::alloc::vec::Vec<Any>,
    }

    /// `google.protobuf.Any`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Any {
        #[prost(string, tag = "1")]
        pub type_url: ::prost::alloc::string::String,
        #[prost(bytes = "vec", tag = "2")]
        pub value: ::prost::alloc::vec::Vec<u8>,
    }
}

/// Protobuf codec for any prost message type.
pub struct ProtoCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ProtoCodec<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Codec<T> for ProtoCodec<T>
where
    T: Message + Default,
{
    fn encoding_name(&self) -> &'static str {
        "proto"
    }

    fn serialize(&self, message: &T) -> Result<Bytes, ConnectError> {
        Ok(Bytes::from(message.encode_to_vec()))
    }

    // prost writes fields in tag order, so the regular encoding already
    // satisfies the deterministic contract.

    fn deserialize(&self, bytes: &Bytes) -> Result<T, ConnectError> {
        T::decode(bytes.as_ref()).map_err(|e| {
            ConnectError::serialization(format!("protobuf decoding failed: {e}"))
                .with_source(e)
        })
    }
}

/// JSON codec for any serde type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encoding_name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, message: &T) -> Result<Bytes, ConnectError> {
        serde_json::to_vec(message).map(Bytes::from).map_err(|e| {
            ConnectError::serialization(format!("JSON encoding failed: {e}")).with_source(e)
        })
    }

    fn deserialize(&self, bytes: &Bytes) -> Result<T, ConnectError> {
        serde_json::from_slice(bytes).map_err(|e| {
            ConnectError::serialization(format!("JSON decoding failed: {e}")).with_source(e)
        })
    }
}

/// Parses `google.rpc.Status` detail payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct GoogleRpcDetailParser;

impl ErrorDetailParser for GoogleRpcDetailParser {
    fn parse_details(&self, bytes: &[u8]) -> Vec<ErrorDetail> {
        match pb::Status::decode(bytes) {
            Ok(status) => status
                .details
                .into_iter()
                .map(|any| ErrorDetail::new(any.type_url, any.value))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn serialize_details(&self, details: &[ErrorDetail]) -> Result<Bytes, ConnectError> {
        let status = pb::Status {
            code: 0,
            message: String::new(),
            details: details
                .iter()
                .map(|d| pb::Any {
                    type_url: d.type_url().to_string(),
                    value: d.value().to_vec(),
                })
                .collect(),
        };
        Ok(Bytes::from(status.encode_to_vec()))
    }
}

/// Unpack one detail into a concrete prost message, if the payload
/// decodes as that type.
pub fn unpack_detail<T: Message + Default>(detail: &ErrorDetail) -> Option<T> {
    T::decode(detail.value()).ok()
}

/// Protobuf strategy: content types `application/proto` and
/// `application/connect+proto` (and the gRPC equivalents).
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtoStrategy;

impl SerializationStrategy for ProtoStrategy {
    fn serialization_name(&self) -> &'static str {
        "proto"
    }

    fn error_detail_parser(&self) -> Arc<dyn ErrorDetailParser> {
        Arc::new(GoogleRpcDetailParser)
    }
}

/// JSON strategy: content types `application/json` and
/// `application/connect+json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonStrategy;

impl SerializationStrategy for JsonStrategy {
    fn serialization_name(&self) -> &'static str {
        "json"
    }

    fn error_detail_parser(&self) -> Arc<dyn ErrorDetailParser> {
        Arc::new(GoogleRpcDetailParser)
    }
}
