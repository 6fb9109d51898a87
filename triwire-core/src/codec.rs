//! Serialization seams.
//!
//! The protocol engine never depends on a concrete message runtime. A
//! [`Codec`] turns one message type into bytes and back; a
//! [`SerializationStrategy`] names the encoding (for content-type
//! negotiation) and supplies the [`ErrorDetailParser`] used to decode
//! protobuf error details from trailers.

use bytes::Bytes;

use crate::error::{ConnectError, ErrorDetail};

/// A (de)serializer bound to a message type and an encoding name.
pub trait Codec<T>: Send + Sync {
    /// The encoding name used to build content types (e.g. "proto",
    /// "json").
    fn encoding_name(&self) -> &'static str;

    fn serialize(&self, message: &T) -> Result<Bytes, ConnectError>;

    /// A stable serialization of the message, used when the bytes become
    /// part of a cache key (Connect GET requests). Defaults to
    /// [`serialize`](Codec::serialize) for codecs whose regular output is
    /// already deterministic.
    fn deterministic_serialize(&self, message: &T) -> Result<Bytes, ConnectError> {
        self.serialize(message)
    }

    fn deserialize(&self, bytes: &Bytes) -> Result<T, ConnectError>;
}

/// Parses the packed error-detail payload carried by
/// `grpc-status-details-bin` (a serialized `google.rpc.Status`).
pub trait ErrorDetailParser: Send + Sync {
    /// Decode a packed detail payload into individual details. Undecodable
    /// payloads yield an empty list; the status code and message from the
    /// surrounding trailers always win.
    fn parse_details(&self, bytes: &[u8]) -> Vec<ErrorDetail>;

    /// Pack details back into the wire payload shape.
    fn serialize_details(&self, details: &[ErrorDetail]) -> Result<Bytes, ConnectError>;
}

/// Names the message encoding in use and supplies the error-detail parser
/// for it. One strategy is configured per client; the per-method codecs
/// are expected to come from the same strategy so the advertised content
/// type matches the bytes on the wire.
pub trait SerializationStrategy: Send + Sync {
    /// The encoding name used to build content types.
    fn serialization_name(&self) -> &'static str;

    fn error_detail_parser(&self) -> std::sync::Arc<dyn ErrorDetailParser>;
}
