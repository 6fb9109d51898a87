//! Client-side protocol engine for Connect, gRPC, and gRPC-Web.
//!
//! A caller hands the [`ProtocolClient`] a typed message and a
//! [`MethodSpec`]; the engine negotiates headers, codec, and compression,
//! frames the request, drives the HTTP transport, parses response frames
//! and trailers (or their in-band equivalents), and surfaces either a
//! typed response or a [`ConnectError`] with typed details. The surface
//! is the same whichever of the three wire protocols is configured.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use triwire_client::{
//!     MethodSpec, NetworkProtocol, ProtoCodec, ProtoStrategy, ProtocolClient,
//!     ProtocolClientConfig, StreamKind,
//! };
//!
//! let config = ProtocolClientConfig::new("https://api.example.com", Arc::new(ProtoStrategy))
//!     .network_protocol(NetworkProtocol::Grpc);
//! let client = ProtocolClient::new(transport, config);
//!
//! let spec = MethodSpec::new(
//!     "users.v1.UserService/GetUser",
//!     StreamKind::Unary,
//!     Arc::new(ProtoCodec::<GetUserRequest>::default()),
//!     Arc::new(ProtoCodec::<GetUserResponse>::default()),
//! );
//! let response = client.unary(&request, headers, &spec).await;
//! ```
//!
//! The HTTP transport itself is a collaborator, not part of this crate:
//! implement [`HttpClientInterface`] over your stack of choice. Exactly
//! one HTTP attempt is issued per call; retries, hedging, and load
//! balancing belong above this layer.

mod client;
pub mod config;
mod interceptor;
pub mod protocol;
mod request;
mod response;
mod strategy;
mod stream;
pub mod transport;

pub use client::ProtocolClient;
pub use config::{
    GetConfiguration, InterceptorFactory, NetworkProtocol, ProtocolClientConfig,
};
pub use interceptor::{
    Interceptor, InterceptorChain, RequestBodyFunction, RequestFunction,
    ResponseFunction, StreamFunction, StreamResultFunction, UnaryFunction,
};
pub use request::{HttpRequest, Idempotency, MethodDescriptor, MethodSpec, StreamKind};
pub use response::{HttpResponse, ResponseMessage, TracingInfo};
pub use strategy::{
    GoogleRpcDetailParser, JsonCodec, JsonStrategy, ProtoCodec, ProtoStrategy,
    unpack_detail,
};
pub use stream::{
    BidirectionalStream, ClientOnlyStream, ServerOnlyStream, StreamReceiver,
    StreamSender, StreamState,
};
pub use transport::{AbortHandle, HttpClientInterface, TransportStream, WriteFrame};

// Re-export the core types callers touch on every request.
pub use triwire_core::{
    Code, Codec, Completion, CompressionPool, ConnectError, ErrorDetail,
    ErrorDetailParser, GzipCompressionPool, Headers, RequestCompression,
    SerializationStrategy, StreamResult,
};
