//! Interceptors: bidirectional transforms over requests and responses.
//!
//! An interceptor is a pair of factories. Each call asks the chain for a
//! fresh [`UnaryFunction`] or [`StreamFunction`], so per-call state (a
//! stream's negotiated response compression, whether its end-stream frame
//! has been seen) lives inside the returned closures and never leaks
//! across calls.
//!
//! The protocol client appends exactly one protocol interceptor after all
//! user interceptors, placing it nearest the transport: it is the last to
//! shape an outgoing request and the first to see raw response data.

use std::sync::Arc;

use bytes::Bytes;
use triwire_core::{ConnectError, StreamResult};

use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Transforms an outgoing request before it reaches the transport.
pub type RequestFunction =
    Box<dyn FnMut(HttpRequest) -> Result<HttpRequest, ConnectError> + Send>;

/// Transforms an incoming unary response.
///
/// Response functions do not fail; they record failures on
/// [`HttpResponse::cause`] so the rest of the chain still observes the
/// response.
pub type ResponseFunction = Box<dyn FnMut(HttpResponse) -> HttpResponse + Send>;

/// Transforms one outbound stream message (already serialized).
pub type RequestBodyFunction =
    Box<dyn FnMut(Bytes) -> Result<Bytes, ConnectError> + Send>;

/// Transforms one inbound stream event. Message events carry one complete
/// envelope frame.
pub type StreamResultFunction =
    Box<dyn FnMut(StreamResult<Bytes>) -> StreamResult<Bytes> + Send>;

/// The unary transform pair for one call.
pub struct UnaryFunction {
    pub request: RequestFunction,
    pub response: ResponseFunction,
}

impl UnaryFunction {
    /// A pass-through pair.
    pub fn identity() -> Self {
        Self {
            request: Box::new(|request| Ok(request)),
            response: Box::new(|response| response),
        }
    }
}

/// The stream transform triple for one call.
pub struct StreamFunction {
    pub request: RequestFunction,
    pub request_body: RequestBodyFunction,
    pub stream_result: StreamResultFunction,
}

impl StreamFunction {
    /// A pass-through triple.
    pub fn identity() -> Self {
        Self {
            request: Box::new(|request| Ok(request)),
            request_body: Box::new(|body| Ok(body)),
            stream_result: Box::new(|result| result),
        }
    }
}

/// A bidirectional transform applied uniformly to every call on a client.
pub trait Interceptor: Send + Sync {
    /// Build the transform pair for one unary call.
    fn unary_function(&self) -> UnaryFunction {
        UnaryFunction::identity()
    }

    /// Build the transform triple for one streaming call.
    fn stream_function(&self) -> StreamFunction {
        StreamFunction::identity()
    }
}

/// Ordered composition of interceptors.
///
/// Request and request-body functions fold in registration order;
/// response and stream-result functions fold in reverse. The interceptor
/// registered last therefore wraps the wire: last to touch outgoing data,
/// first to touch incoming data.
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Compose a fresh unary transform pair for one call.
    pub fn unary_function(&self) -> UnaryFunction {
        let mut requests: Vec<RequestFunction> = Vec::with_capacity(self.interceptors.len());
        let mut responses: Vec<ResponseFunction> =
            Vec::with_capacity(self.interceptors.len());

        for interceptor in &self.interceptors {
            let f = interceptor.unary_function();
            requests.push(f.request);
            responses.push(f.response);
        }

        UnaryFunction {
            request: Box::new(move |mut request| {
                for f in requests.iter_mut() {
                    request = f(request)?;
                }
                Ok(request)
            }),
            response: Box::new(move |mut response| {
                for f in responses.iter_mut().rev() {
                    response = f(response);
                }
                response
            }),
        }
    }

    /// Compose a fresh stream transform triple for one call.
    pub fn stream_function(&self) -> StreamFunction {
        let mut requests: Vec<RequestFunction> = Vec::with_capacity(self.interceptors.len());
        let mut bodies: Vec<RequestBodyFunction> = Vec::with_capacity(self.interceptors.len());
        let mut results: Vec<StreamResultFunction> =
            Vec::with_capacity(self.interceptors.len());

        for interceptor in &self.interceptors {
            let f = interceptor.stream_function();
            requests.push(f.request);
            bodies.push(f.request_body);
            results.push(f.stream_result);
        }

        StreamFunction {
            request: Box::new(move |mut request| {
                for f in requests.iter_mut() {
                    request = f(request)?;
                }
                Ok(request)
            }),
            request_body: Box::new(move |mut body| {
                for f in bodies.iter_mut() {
                    body = f(body)?;
                }
                Ok(body)
            }),
            stream_result: Box::new(move |mut result| {
                for f in results.iter_mut().rev() {
                    result = f(result);
                }
                result
            }),
        }
    }
}
