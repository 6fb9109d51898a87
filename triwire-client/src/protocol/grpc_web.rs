//! The gRPC-Web protocol interceptor.
//!
//! gRPC-Web is gRPC for clients that cannot read HTTP trailers: the
//! trailer block travels in-band instead, as a final envelope with flag
//! 0x80 whose payload is an ASCII `key: value\r\n` block. Everything else
//! (enveloped messages, `grpc-encoding`, status semantics) matches gRPC.

use std::sync::Arc;

use bytes::Bytes;
use triwire_core::{
    Code, Completion, ConnectError, FrameBuffer, Headers, StreamResult, is_trailers,
    pack, unpack_with_header_byte,
};

use super::completion::parse_trailer_block;
use super::grpc::{apply_grpc_request_headers, resolve_completion};
use super::{GRPC_ENCODING, response_pool};
use crate::config::ProtocolClientConfig;
use crate::interceptor::{Interceptor, StreamFunction, UnaryFunction};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Installed when the client is configured for
/// [`NetworkProtocol::GrpcWeb`](crate::config::NetworkProtocol::GrpcWeb).
pub struct GrpcWebInterceptor {
    config: Arc<ProtocolClientConfig>,
}

impl GrpcWebInterceptor {
    pub fn new(config: Arc<ProtocolClientConfig>) -> Self {
        Self { config }
    }
}

impl Interceptor for GrpcWebInterceptor {
    fn unary_function(&self) -> UnaryFunction {
        let request_config = self.config.clone();
        let response_config = self.config.clone();

        UnaryFunction {
            request: Box::new(move |mut request: HttpRequest| {
                let config = &request_config;
                apply_grpc_request_headers(&mut request, config, "application/grpc-web");

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

                match split_unary_body(config, &response) {
                    Ok((message, trailers)) => {
                        response.trailers.merge(&trailers);
                        let completion = resolve_completion(
                            config,
                            &response.trailers,
                            Some(&response.headers),
                        );
                        if completion.is_ok() {
                            match message {
                                Some(message) => {
                                    response.code = Code::Ok;
                                    response.message = message;
                                }
                                None => {
                                    let error = ConnectError::protocol(
                                        "unary response has no message",
                                    );
                                    response.code = error.code();
                                    response.cause = Some(error);
                                }
                            }
                        } else {
                            let mut metadata = response.headers.clone();
                            metadata.merge(&response.trailers);
                            response.code = completion.code;
                            response.cause = completion
                                .error
                                .map(|error| error.with_metadata(metadata));
                        }
                    }
                    Err(error) => {
                        response.code = error.code();
                        response.cause = Some(error);
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
        let mut saw_trailer_frame = false;

        StreamFunction {
            request: Box::new(move |mut request: HttpRequest| {
                apply_grpc_request_headers(
                    &mut request,
                    &request_config,
                    "application/grpc-web",
                );
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
                            Ok(message) => {
                                if is_trailers(message.flags) {
                                    saw_trailer_frame = true;
                                    let trailers =
                                        parse_trailer_block(&message.payload);
                                    StreamResult::Complete(resolve_completion(
                                        config,
                                        &trailers,
                                        response_headers.as_ref(),
                                    ))
                                } else {
                                    StreamResult::Message(message.payload)
                                }
                            }
                            Err(e) => {
                                StreamResult::Complete(Completion::from_error(e.into()))
                            }
                        }
                    }
                    StreamResult::Complete(completion) => {
                        if saw_trailer_frame || completion.error.is_some() {
                            return StreamResult::Complete(completion);
                        }
                        // No in-band trailer frame arrived; fall back to
                        // whatever the transport observed.
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

/// Split a unary gRPC-Web body into its message envelope and its trailer
/// envelope (flag 0x80).
fn split_unary_body(
    config: &ProtocolClientConfig,
    response: &HttpResponse,
) -> Result<(Option<Bytes>, Headers), ConnectError> {
    let pool = response_pool(config, &response.headers, GRPC_ENCODING)?;

    let mut buffer = FrameBuffer::new();
    buffer.extend(&response.message);

    let mut message = None;
    let mut trailers = Headers::new();
    while let Some(frame) = buffer.next_frame() {
        let unpacked = unpack_with_header_byte(&frame, pool.as_deref())?;
        if is_trailers(unpacked.flags) {
            trailers.merge(&parse_trailer_block(&unpacked.payload));
        } else if message.is_none() {
            message = Some(unpacked.payload);
        } else {
            return Err(ConnectError::protocol("unary response has multiple messages"));
        }
    }
    if buffer.pending() > 0 {
        return Err(ConnectError::protocol("truncated envelope in response body"));
    }
    Ok((message, trailers))
}
