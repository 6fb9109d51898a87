//! Incoming response types.

use bytes::Bytes;
use triwire_core::{Code, ConnectError, Headers};

/// Transport-level observations about a response, kept separate from the
/// protocol-level [`Code`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingInfo {
    pub http_status: Option<u16>,
}

/// One HTTP response, as seen by the interceptor chain.
///
/// The transport builds this before any response function runs, mapping
/// the HTTP status to an initial [`Code`] and recording I/O failures in
/// `cause`. Interceptors then replace fields as they parse protocol
/// framing: the gRPC interceptor rewrites `code` from the status trailer,
/// the Connect interceptor fills `cause` from the error JSON, and so on.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub code: Code,
    pub headers: Headers,
    pub message: Bytes,
    pub trailers: Headers,
    pub tracing: TracingInfo,
    pub cause: Option<ConnectError>,
}

impl HttpResponse {
    /// A response representing a transport failure. The interceptor chain
    /// still runs over it, but every response function passes an existing
    /// cause through untouched.
    pub fn from_error(error: ConnectError) -> Self {
        Self {
            code: error.code(),
            headers: Headers::new(),
            message: Bytes::new(),
            trailers: Headers::new(),
            tracing: TracingInfo::default(),
            cause: Some(error),
        }
    }
}

/// The caller-facing result of a unary RPC.
#[derive(Debug)]
pub struct ResponseMessage<T> {
    pub headers: Headers,
    pub trailers: Headers,
    pub result: Result<T, ConnectError>,
}

impl<T> ResponseMessage<T> {
    /// The decoded message, if the call succeeded.
    pub fn message(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// The error, if the call failed.
    pub fn error(&self) -> Option<&ConnectError> {
        self.result.as_ref().err()
    }

    /// Unwrap into a plain `Result`, discarding metadata.
    pub fn into_result(self) -> Result<T, ConnectError> {
        self.result
    }
}
