//! The boundary between the protocol engine and an HTTP transport.
//!
//! The engine issues exactly one HTTP attempt per call and never touches
//! sockets itself. A transport implementation (hyper, a test double, a
//! browser bridge) implements [`HttpClientInterface`]: one future per
//! unary exchange, and a channel-backed [`TransportStream`] for streaming
//! calls.
//!
//! Contract for implementations:
//!
//! - `unary` always resolves to an [`HttpResponse`]; I/O failures are
//!   reported via [`HttpResponse::from_error`] (code UNAVAILABLE unless
//!   already typed) so the response interceptors always run.
//! - A stream's `results` channel delivers `Headers` first, then raw body
//!   chunks as `Message(Bytes)` in receipt order, then at most one
//!   `Complete` carrying the HTTP trailers (empty if the connection ended
//!   without them), after which the channel closes.
//! - Headers handed to the engine are not mutated after dispatch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use triwire_core::StreamResult;

use crate::request::HttpRequest;
use crate::response::HttpResponse;
use triwire_core::ConnectError;

/// Type alias for a boxed future returning a result.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The HTTP client the engine drives.
pub trait HttpClientInterface: Send + Sync {
    /// Perform a single request/response exchange.
    fn unary(&self, request: HttpRequest) -> BoxFuture<'static, HttpResponse>;

    /// Open a bidirectional byte stream for a streaming call.
    fn open_stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<TransportStream, ConnectError>>;
}

/// One outbound frame on a stream's write half.
#[derive(Clone, Debug)]
pub enum WriteFrame {
    Data(Bytes),
    /// Half-close: no more data will follow.
    Close,
}

/// Aborts a transport stream (both halves) when cancellation is requested.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new<F: Fn() + Send + Sync + 'static>(f: F) -> Self {
        Self(Arc::new(f))
    }

    /// A handle that does nothing, for transports with no teardown.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn abort(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// A byte-oriented bidirectional stream handed back by the transport.
#[derive(Debug)]
pub struct TransportStream {
    /// Write half: enveloped request frames, then [`WriteFrame::Close`].
    pub writes: mpsc::Sender<WriteFrame>,
    /// Read half: headers, raw body chunks, terminal completion.
    pub results: mpsc::Receiver<StreamResult<Bytes>>,
    /// Tears down the underlying connection on cancellation.
    pub abort: AbortHandle,
}
