//! The error type surfaced to RPC callers.
//!
//! Every failure, whether from the transport, the framing layer, a codec,
//! or a status returned by the server, reaches the caller as a
//! [`ConnectError`] carrying a [`Code`], an optional message, typed error
//! details, response metadata, and the originating error as its source.

use std::sync::Arc;

use crate::code::Code;
use crate::headers::Headers;

/// A self-describing error detail attached to an RPC error.
///
/// Details map to `google.protobuf.Any` on the wire: a fully-qualified type
/// name plus the protobuf-encoded message bytes. In the Connect error JSON
/// they appear as `{"type": "...", "value": "<base64>"}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetail {
    type_url: String,
    value: Vec<u8>,
}

impl ErrorDetail {
    /// Create a new error detail with a type name and protobuf-encoded bytes.
    pub fn new<S: Into<String>>(type_url: S, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// The fully-qualified type name, with any `type.googleapis.com/`
    /// prefix stripped (Connect uses short type names).
    pub fn type_url(&self) -> &str {
        self.type_url
            .strip_prefix("type.googleapis.com/")
            .unwrap_or(&self.type_url)
    }

    /// The protobuf-encoded value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// An RPC error: a non-OK [`Code`] plus everything the server (or the
/// protocol engine) attached to it.
#[derive(Clone, Debug)]
pub struct ConnectError {
    code: Code,
    message: Option<String>,
    details: Vec<ErrorDetail>,
    metadata: Headers,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ConnectError {
    /// Create a new error with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: Vec::new(),
            metadata: Headers::new(),
            source: None,
        }
    }

    /// Create a new error with just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
            metadata: Headers::new(),
            source: None,
        }
    }

    /// A transport-level failure (connection refused, reset, I/O error).
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// A protocol violation (malformed frame, unknown compression, bad
    /// trailers).
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    /// A codec failure while encoding or decoding a message.
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Attach the originating error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Attach error details.
    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    /// Add a single error detail.
    pub fn add_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Attach response metadata (headers and trailers observed on the wire).
    pub fn with_metadata(mut self, metadata: Headers) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    pub fn metadata(&self) -> &Headers {
        &self.metadata
    }
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
