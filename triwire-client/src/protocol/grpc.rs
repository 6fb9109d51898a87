//! The gRPC protocol interceptor.
//!
//! gRPC always answers HTTP 200; the real status lives in the
//! `grpc-status` trailer (or in the header block for trailers-only
//! responses). Every message, unary included, is enveloped, and
//! compression is signalled with `grpc-encoding`.

use std::sync::Arc;

use bytes::Bytes;
use triwire_core::{
    Code, Completion, ConnectError, Headers, StreamResult, pack, unpack_with_header_byte,
};

use super::completion::{GRPC_STATUS, completion_from_trailers};
use super::{
    CONTENT_TYPE, GRPC_ACCEPT_ENCODING, GRPC_ENCODING, GRPC_TIMEOUT, TE, response_pool,
    set_default_user_agent, timeout_millis,
};
use crate::config::ProtocolClientConfig;
use crate::interceptor::{Interceptor, StreamFunction, UnaryFunction};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Installed when the client is configured for
/// [`NetworkProtocol::Grpc`](crate::config::NetworkProtocol::Grpc).
pub struct GrpcInterceptor {
    config: Arc<ProtocolClientConfig>,
}

impl GrpcInterceptor {
    pub fn new(config: Arc<ProtocolClientConfig>) -> Self {
        Self { config }
    }
}

/// Shared request shaping for gRPC and gRPC-Web.
pub(super) fn apply_grpc_request_headers(
    request: &mut HttpRequest,
    config: &ProtocolClientConfig,
    content_type_prefix: &str,
) {
    request.headers.insert(
        CONTENT_TYPE,
        &format!("{content_type_prefix}+{}", config.codec_name()),
    );
    set_default_user_agent(&mut request.headers);
    if let Some(accept) = config.acceptable_compression() {
        request.headers.insert(GRPC_ACCEPT_ENCODING, &accept);
    }
    if let Some(compression) = &config.request_compression {
        request.headers.insert(GRPC_ENCODING, compression.pool.name());
    }
    if let Some(timeout) = config.timeout
        && let Some(ms) = timeout_millis(timeout)
    {
        request.headers.insert(GRPC_TIMEOUT, &format!("{ms}m"));
    }
}

/// Resolve the completion for a finished gRPC(-Web) call: trailers first,
/// then the header block (trailers-only responses), then give up with
/// UNKNOWN, which per the gRPC spec is what a missing status means.
pub(super) fn resolve_completion(
    config: &ProtocolClientConfig,
    trailers: &Headers,
    headers: Option<&Headers>,
) -> Completion {
    let parser = config.serialization_strategy.error_detail_parser();
    if let Some(completion) = completion_from_trailers(trailers, parser.as_ref()) {
        return completion;
    }
    if let Some(headers) = headers
        && let Some(completion) = completion_from_trailers(headers, parser.as_ref())
    {
        return completion;
    }
    Completion::from_error(ConnectError::new(
        Code::Unknown,
        "stream closed without a grpc-status trailer",
    ))
}

impl Interceptor for GrpcInterceptor {
    fn unary_function(&self) -> UnaryFunction {
        let request_config = self.config.clone();
        let response_config = self.config.clone();

        UnaryFunction {
            request: Box::new(move |mut request: HttpRequest| {
                let config = &request_config;
                apply_grpc_request_headers(&mut request, config, "application/grpc");
                request.headers.insert(TE, "trailers");

                if let Some(message) = request.message.take() {
                    let framed = pack(&message, config.request_compression.as_ref())?;
                    request.message = Some(framed);
                }
                Ok(request)
            }),
            response: Box::new(move |mut response: HttpResponse| {
                if response.cause.is_some() {
                    return response;
                }
                let config = &response_config;

                // Trailers-only responses carry the status in the headers.
                let trailer_source = if response.trailers.contains_key(GRPC_STATUS) {
                    response.trailers.clone()
                } else if response.headers.contains_key(GRPC_STATUS) {
                    response.trailers = response.headers.clone();
                    response.headers.clone()
                } else {
                    Headers::new()
                };

                let parser = config.serialization_strategy.error_detail_parser();
                let completion =
                    completion_from_trailers(&trailer_source, parser.as_ref());

                match completion {
                    None => {
                        let code = response
                            .tracing
                            .http_status
                            .filter(|s| *s != 200)
                            .map(Code::from_http_status)
                            .unwrap_or(Code::Unknown);
                        let error =
                            ConnectError::new(code, "missing grpc-status trailer");
                        response.code = error.code();
                        response.cause = Some(error);
                    }
                    Some(completion) if completion.is_ok() => {
                        response.code = Code::Ok;
                        match unwrap_unary_message(config, &response) {
                            Ok(message) => response.message = message,
                            Err(error) => {
                                response.code = error.code();
                                response.cause = Some(error);
                            }
                        }
                    }
                    Some(completion) => {
                        let mut metadata = response.headers.clone();
                        metadata.merge(&response.trailers);
                        response.code = completion.code;
                        response.cause = completion
                            .error
                            .map(|error| error.with_metadata(metadata));
                    }
                }
                response
            }),
        }
    }

    fn stream_function(&self) -> StreamFunction {
        let request_config = self.config.clone();
        let body_config = self.config.clone();
        let result_config = self.config.clone();

        let mut response_pool_state = None;
        let mut response_headers: Option<Headers> = None;

        StreamFunction {
            request: Box::new(move |mut request: HttpRequest| {
                apply_grpc_request_headers(
                    &mut request,
                    &request_config,
                    "application/grpc",
                );
                request.headers.insert(TE, "trailers");
                Ok(request)
            }),
            request_body: Box::new(move |body: Bytes| {
                pack(&body, body_config.request_compression.as_ref()).map_err(Into::into)
            }),
            stream_result: Box::new(move |result: StreamResult<Bytes>| {
                let config = &result_config;
                match result {
                    StreamResult::Headers(headers) => {
                        match response_pool(config, &headers, GRPC_ENCODING) {
                            Ok(pool) => {
                                response_pool_state = pool;
                                response_headers = Some(headers.clone());
                                StreamResult::Headers(headers)
                            }
                            Err(error) => {
                                StreamResult::Complete(Completion::from_error(error))
                            }
                        }
                    }
                    StreamResult::Message(frame) => {
                        match unpack_with_header_byte(
                            &frame,
                            response_pool_state.as_deref(),
                        ) {
                            Ok(message) => StreamResult::Message(message.payload),
                            Err(e) => {
                                StreamResult::Complete(Completion::from_error(e.into()))
                            }
                        }
                    }
                    StreamResult::Complete(completion) => {
                        if completion.error.is_some() {
                            return StreamResult::Complete(completion);
                        }
                        StreamResult::Complete(resolve_completion(
                            config,
                            &completion.trailers,
                            response_headers.as_ref(),
                        ))
                    }
                }
            }),
        }
    }
}

/// Unwrap the single enveloped message of a successful unary response.
fn unwrap_unary_message(
    config: &ProtocolClientConfig,
    response: &HttpResponse,
) -> Result<Bytes, ConnectError> {
    if response.message.is_empty() {
        return Err(ConnectError::protocol("unary response has no message"));
    }
    let pool = response_pool(config, &response.headers, GRPC_ENCODING)?;
    let message = unpack_with_header_byte(&response.message, pool.as_deref())?;
    Ok(message.payload)
}
