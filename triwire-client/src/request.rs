//! Outgoing request types.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Uri};
use triwire_core::{Codec, Headers};

/// The streaming shape of an RPC method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

/// Whether a method is safe to retry or encode as a GET.
///
/// Mirrors the protobuf `idempotency_level` method option; only
/// `NO_SIDE_EFFECTS` methods are eligible for Connect GET requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Idempotency {
    #[default]
    Unknown,
    NoSideEffects,
}

/// A fully-typed method description: the URL path, streaming shape,
/// idempotency, and the codecs for both message types.
///
/// Generated service stubs construct one `MethodSpec` per method; nothing
/// in the engine is specific to any message runtime beyond the codecs
/// carried here.
pub struct MethodSpec<Req, Res> {
    /// `package.Service/Method`, with no leading slash.
    pub path: Cow<'static, str>,
    pub stream_kind: StreamKind,
    pub idempotency: Idempotency,
    pub request_codec: Arc<dyn Codec<Req>>,
    pub response_codec: Arc<dyn Codec<Res>>,
}

impl<Req, Res> MethodSpec<Req, Res> {
    pub fn new(
        path: impl Into<Cow<'static, str>>,
        stream_kind: StreamKind,
        request_codec: Arc<dyn Codec<Req>>,
        response_codec: Arc<dyn Codec<Res>>,
    ) -> Self {
        Self {
            path: path.into(),
            stream_kind,
            idempotency: Idempotency::Unknown,
            request_codec,
            response_codec,
        }
    }

    /// Mark the method as having no side effects (GET-eligible).
    pub fn idempotent(mut self) -> Self {
        self.idempotency = Idempotency::NoSideEffects;
        self
    }

    /// The type-erased view carried on [`HttpRequest`].
    pub fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            path: self.path.to_string(),
            stream_kind: self.stream_kind,
            idempotency: self.idempotency,
        }
    }
}

impl<Req, Res> Clone for MethodSpec<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            stream_kind: self.stream_kind,
            idempotency: self.idempotency,
            request_codec: self.request_codec.clone(),
            response_codec: self.response_codec.clone(),
        }
    }
}

impl<Req, Res> std::fmt::Debug for MethodSpec<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodSpec")
            .field("path", &self.path)
            .field("stream_kind", &self.stream_kind)
            .field("idempotency", &self.idempotency)
            .finish()
    }
}

/// The message-type-erased part of a [`MethodSpec`], visible to
/// interceptors on every request.
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    pub path: String,
    pub stream_kind: StreamKind,
    pub idempotency: Idempotency,
}

/// One HTTP request, as seen by the interceptor chain.
///
/// Built by the protocol client, then transformed by each request function
/// in the chain before reaching the transport. For streaming calls the
/// message is `None`; stream bodies flow through the request-body
/// functions instead.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub uri: Uri,
    pub method: Method,
    pub headers: Headers,
    pub message: Option<Bytes>,
    pub descriptor: MethodDescriptor,
}
