//! The Connect protocol interceptor.
//!
//! Unary calls are plain HTTP exchanges: raw message bodies, errors as a
//! JSON object on non-2xx responses, trailers as `trailer-`-prefixed
//! headers. Idempotent calls can be encoded as cacheable GET requests
//! with the message in the query string. Streaming calls use envelope
//! framing with a JSON end-stream frame (flag 0x02) carrying the error
//! and trailing metadata.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http::Uri;
use serde::Deserialize;
use triwire_core::{
    Code, Completion, ConnectError, ErrorDetail, Headers, StreamResult, is_end_stream,
    pack, unpack_with_header_byte,
};

use super::completion::decode_base64_value;
use super::{
    ACCEPT_ENCODING, CONNECT_PROTOCOL_VERSION, CONNECT_PROTOCOL_VERSION_HEADER,
    CONNECT_STREAMING_ACCEPT_ENCODING, CONNECT_STREAMING_CONTENT_ENCODING,
    CONNECT_TIMEOUT_MS, CONTENT_ENCODING, CONTENT_TYPE, response_pool,
    set_default_user_agent, should_use_get, timeout_millis,
};
use crate::config::ProtocolClientConfig;
use crate::interceptor::{Interceptor, StreamFunction, UnaryFunction};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Installed when the client is configured for
/// [`NetworkProtocol::Connect`](crate::config::NetworkProtocol::Connect).
pub struct ConnectInterceptor {
    config: Arc<ProtocolClientConfig>,
}

impl ConnectInterceptor {
    pub fn new(config: Arc<ProtocolClientConfig>) -> Self {
        Self { config }
    }
}

impl Interceptor for ConnectInterceptor {
    fn unary_function(&self) -> UnaryFunction {
        let request_config = self.config.clone();
        let response_config = self.config.clone();

        UnaryFunction {
            request: Box::new(move |mut request: HttpRequest| {
                let config = &request_config;
                request.headers.insert(
                    CONNECT_PROTOCOL_VERSION_HEADER,
                    CONNECT_PROTOCOL_VERSION,
                );
                set_default_user_agent(&mut request.headers);
                if let Some(timeout) = config.timeout
                    && let Some(ms) = timeout_millis(timeout)
                {
                    request.headers.insert(CONNECT_TIMEOUT_MS, &ms);
                }
                if let Some(accept) = config.acceptable_compression() {
                    request.headers.insert(ACCEPT_ENCODING, &accept);
                }

                if should_use_get(config, &request.descriptor) {
                    return into_get_request(request, config);
                }

                request.headers.insert(
                    CONTENT_TYPE,
                    &format!("application/{}", config.codec_name()),
                );
                if let Some(compression) = &config.request_compression
                    && let Some(message) = &request.message
                    && compression.should_compress(message.len())
                {
                    let compressed = compression.pool.compress(message).map_err(|e| {
                        ConnectError::protocol(format!("compression failed: {e}"))
                    })?;
                    request.message = Some(compressed);
                    request
                        .headers
                        .insert(CONTENT_ENCODING, compression.pool.name());
                }
                Ok(request)
            }),
            response: Box::new(move |mut response: HttpResponse| {
                if response.cause.is_some() {
                    return response;
                }
                let config = &response_config;

                let promoted = response.headers.extract_prefixed("trailer-");
                response.trailers.merge(&promoted);

                if response.code != Code::Ok {
                    let error = parse_unary_error(config, &response);
                    response.code = error.code();
                    response.cause = Some(error);
                    return response;
                }

                match response_pool(config, &response.headers, CONTENT_ENCODING) {
                    Ok(Some(pool)) => match pool.decompress(&response.message) {
                        Ok(message) => response.message = message,
                        Err(e) => {
                            let error = ConnectError::protocol(format!(
                                "decompression failed: {e}"
                            ));
                            response.code = error.code();
                            response.cause = Some(error);
                        }
                    },
                    Ok(None) => {}
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
        let mut saw_end_stream = false;

        StreamFunction {
            request: Box::new(move |mut request: HttpRequest| {
                let config = &request_config;
                request.headers.insert(
                    CONTENT_TYPE,
                    &format!("application/connect+{}", config.codec_name()),
                );
                request.headers.insert(
                    CONNECT_PROTOCOL_VERSION_HEADER,
                    CONNECT_PROTOCOL_VERSION,
                );
                set_default_user_agent(&mut request.headers);
                if let Some(timeout) = config.timeout
                    && let Some(ms) = timeout_millis(timeout)
                {
                    request.headers.insert(CONNECT_TIMEOUT_MS, &ms);
                }
                if let Some(accept) = config.acceptable_compression() {
                    request
                        .headers
                        .insert(CONNECT_STREAMING_ACCEPT_ENCODING, &accept);
                }
                if let Some(compression) = &config.request_compression {
                    request.headers.insert(
                        CONNECT_STREAMING_CONTENT_ENCODING,
                        compression.pool.name(),
                    );
                }
                Ok(request)
            }),
            request_body: Box::new(move |body: Bytes| {
                pack(&body, body_config.request_compression.as_ref()).map_err(Into::into)
            }),
            stream_result: Box::new(move |result: StreamResult<Bytes>| {
                let config = &result_config;
                match result {
                    StreamResult::Headers(headers) => {
                        match response_pool(
                            config,
                            &headers,
                            CONNECT_STREAMING_CONTENT_ENCODING,
                        ) {
                            Ok(pool) => {
                                response_pool_state = pool;
                                StreamResult::Headers(headers)
                            }
                            Err(error) => {
                                saw_end_stream = true;
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
                                if is_end_stream(message.flags) {
                                    saw_end_stream = true;
                                    StreamResult::Complete(parse_end_stream(
                                        &message.payload,
                                    ))
                                } else {
                                    StreamResult::Message(message.payload)
                                }
                            }
                            Err(e) => {
                                saw_end_stream = true;
                                StreamResult::Complete(Completion::from_error(e.into()))
                            }
                        }
                    }
                    StreamResult::Complete(completion) => {
                        if saw_end_stream
                            || completion.error.is_some()
                            || completion.code != Code::Ok
                        {
                            StreamResult::Complete(completion)
                        } else {
                            StreamResult::Complete(Completion::from_error(
                                ConnectError::new(
                                    Code::Unknown,
                                    "stream closed without an end-stream frame",
                                ),
                            ))
                        }
                    }
                }
            }),
        }
    }
}

/// Re-encode a unary POST as the Connect GET form: no body, message in the
/// query string.
fn into_get_request(
    mut request: HttpRequest,
    config: &ProtocolClientConfig,
) -> Result<HttpRequest, ConnectError> {
    let mut message = request.message.take().unwrap_or_default();

    let mut compression_param = None;
    if let Some(compression) = &config.request_compression
        && compression.should_compress(message.len())
    {
        message = compression.pool.compress(&message).map_err(|e| {
            ConnectError::protocol(format!("compression failed: {e}"))
        })?;
        compression_param = Some(compression.pool.name());
    }

    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&message);
    let mut query = format!(
        "connect=v1&encoding={}&message={}&base64=1",
        config.codec_name(),
        encoded
    );
    if let Some(name) = compression_param {
        query.push_str("&compression=");
        query.push_str(name);
    }

    let path = request.uri.path();
    let path_and_query = format!("{path}?{query}");
    let mut parts = request.uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse().map_err(|e| {
        ConnectError::protocol(format!("failed to build GET url: {e}"))
    })?);
    request.uri = Uri::from_parts(parts)
        .map_err(|e| ConnectError::protocol(format!("failed to build GET url: {e}")))?;

    request.method = http::Method::GET;
    request.headers.remove(CONTENT_TYPE);
    request.headers.remove(CONTENT_ENCODING);
    Ok(request)
}

/// The Connect unary error JSON body.
#[derive(Deserialize)]
struct ErrorPayload {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<DetailPayload>,
}

/// One error detail: short type name plus base64 value.
#[derive(Deserialize)]
struct DetailPayload {
    #[serde(rename = "type")]
    type_url: String,
    #[serde(default)]
    value: String,
}

fn decode_json_details(details: Vec<DetailPayload>) -> Vec<ErrorDetail> {
    details
        .into_iter()
        .filter_map(|d| {
            decode_base64_value(&d.value).map(|value| ErrorDetail::new(d.type_url, value))
        })
        .collect()
}

/// Parse a non-2xx unary response body into an error, falling back to the
/// HTTP status when the body is not a Connect error JSON.
fn parse_unary_error(config: &ProtocolClientConfig, response: &HttpResponse) -> ConnectError {
    let mut metadata = response.headers.clone();
    metadata.merge(&response.trailers);

    let http_code = response
        .tracing
        .http_status
        .map(Code::from_http_status)
        .unwrap_or(response.code);

    let body = match response_pool(config, &response.headers, CONTENT_ENCODING) {
        Ok(Some(pool)) => match pool.decompress(&response.message) {
            Ok(body) => body,
            Err(_) => {
                return ConnectError::new(http_code, "decompression of error body failed")
                    .with_metadata(metadata);
            }
        },
        Ok(None) => response.message.clone(),
        Err(error) => return error.with_metadata(metadata),
    };

    match serde_json::from_slice::<ErrorPayload>(&body) {
        Ok(payload) => {
            let code = Code::from_name(&payload.code).unwrap_or(http_code);
            let mut error = match payload.message {
                Some(message) => ConnectError::new(code, message),
                None => ConnectError::from_code(code),
            };
            error = error
                .with_details(decode_json_details(payload.details))
                .with_metadata(metadata);
            error
        }
        Err(_) => {
            let message = if body.is_empty() {
                format!("HTTP {}", response.tracing.http_status.unwrap_or_default())
            } else {
                String::from_utf8_lossy(&body).into_owned()
            };
            ConnectError::new(http_code, message).with_metadata(metadata)
        }
    }
}

/// Parse an end-stream frame payload:
/// `{"metadata": {...}, "error": {...}}`, both parts optional.
fn parse_end_stream(payload: &[u8]) -> Completion {
    #[derive(Deserialize)]
    struct EndStreamPayload {
        #[serde(default)]
        error: Option<ErrorPayload>,
        #[serde(default)]
        metadata: Option<HashMap<String, Vec<String>>>,
    }

    if payload.is_empty() {
        return Completion::ok(Headers::new());
    }

    let parsed: EndStreamPayload = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Completion::from_error(ConnectError::protocol(format!(
                "invalid end-stream frame: {e}"
            )));
        }
    };

    let trailers = parsed
        .metadata
        .map(Headers::from_json_map)
        .unwrap_or_default();

    match parsed.error {
        None => Completion::ok(trailers),
        Some(payload) => {
            let code = Code::from_name(&payload.code).unwrap_or(Code::Unknown);
            let mut error = match payload.message {
                Some(message) => ConnectError::new(code, message),
                None => ConnectError::from_code(code),
            };
            error = error
                .with_details(decode_json_details(payload.details))
                .with_metadata(trailers.clone());
            Completion::from_error_with_trailers(error, trailers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::StubStrategy;
    use crate::request::{MethodDescriptor, StreamKind};
    use crate::response::TracingInfo;
    use triwire_core::{CompressionPool, GzipCompressionPool, RequestCompression};

    fn config() -> Arc<ProtocolClientConfig> {
        Arc::new(ProtocolClientConfig::new(
            "https://example.com",
            Arc::new(StubStrategy { name: "proto" }),
        ))
    }

    fn unary_request(message: &'static [u8]) -> HttpRequest {
        HttpRequest {
            uri: "https://example.com/pkg.Service/Method".parse().unwrap(),
            method: http::Method::POST,
            headers: Headers::new(),
            message: Some(Bytes::from_static(message)),
            descriptor: MethodDescriptor {
                path: "pkg.Service/Method".to_string(),
                stream_kind: StreamKind::Unary,
                idempotency: crate::request::Idempotency::NoSideEffects,
            },
        }
    }

    fn ok_response(message: Bytes) -> HttpResponse {
        HttpResponse {
            code: Code::Ok,
            headers: Headers::new(),
            message,
            trailers: Headers::new(),
            tracing: TracingInfo { http_status: Some(200) },
            cause: None,
        }
    }

    #[test]
    fn test_unary_request_headers() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let request = (f.request)(unary_request(b"payload")).unwrap();

        assert_eq!(request.headers.get("content-type"), Some("application/proto"));
        assert_eq!(request.headers.get("connect-protocol-version"), Some("1"));
        assert_eq!(request.headers.get("accept-encoding"), Some("gzip"));
        assert!(request.headers.get("user-agent").is_some());
        assert_eq!(request.method, http::Method::POST);
    }

    #[test]
    fn test_unary_caller_user_agent_preserved() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let mut request = unary_request(b"payload");
        request.headers.insert("User-Agent", "my-custom-user-agent");
        let request = (f.request)(request).unwrap();

        assert_eq!(request.headers.get("user-agent"), Some("my-custom-user-agent"));
    }

    #[test]
    fn test_unary_compression_threshold() {
        let config = Arc::new(
            ProtocolClientConfig::new(
                "https://example.com",
                Arc::new(StubStrategy { name: "proto" }),
            )
            .request_compression(RequestCompression::new(
                1024,
                Arc::new(GzipCompressionPool::default()),
            )),
        );
        let interceptor = ConnectInterceptor::new(config);
        let mut f = interceptor.unary_function();

        // Below the threshold: untouched.
        let mut request = unary_request(b"small");
        request.descriptor.idempotency = crate::request::Idempotency::Unknown;
        let request = (f.request)(request).unwrap();
        assert!(request.headers.get("content-encoding").is_none());
        assert_eq!(&request.message.unwrap()[..], b"small");
    }

    #[test]
    fn test_unary_get_encoding() {
        let config = Arc::new(
            ProtocolClientConfig::new(
                "https://example.com",
                Arc::new(StubStrategy { name: "proto" }),
            )
            .get_configuration(crate::config::GetConfiguration::IdempotentOnly),
        );
        let interceptor = ConnectInterceptor::new(config);
        let mut f = interceptor.unary_function();

        let request = (f.request)(unary_request(b"payload")).unwrap();

        assert_eq!(request.method, http::Method::GET);
        assert!(request.message.is_none());
        assert!(request.headers.get("content-type").is_none());

        let query = request.uri.query().unwrap();
        assert!(query.contains("connect=v1"));
        assert!(query.contains("encoding=proto"));
        assert!(query.contains("base64=1"));
        let expected =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"payload");
        assert!(query.contains(&format!("message={expected}")));
    }

    #[test]
    fn test_unary_get_disabled_for_non_idempotent() {
        let config = Arc::new(
            ProtocolClientConfig::new(
                "https://example.com",
                Arc::new(StubStrategy { name: "proto" }),
            )
            .get_configuration(crate::config::GetConfiguration::IdempotentOnly),
        );
        let interceptor = ConnectInterceptor::new(config);
        let mut f = interceptor.unary_function();

        let mut request = unary_request(b"payload");
        request.descriptor.idempotency = crate::request::Idempotency::Unknown;
        let request = (f.request)(request).unwrap();

        assert_eq!(request.method, http::Method::POST);
    }

    #[test]
    fn test_unary_trailer_prefix_promotion() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let mut response = ok_response(Bytes::from_static(b"body"));
        response.headers.insert("trailer-x-result", "done");
        response.headers.insert("x-plain", "kept");
        let response = (f.response)(response);

        assert_eq!(response.trailers.get("x-result"), Some("done"));
        assert!(!response.headers.contains_key("trailer-x-result"));
        assert_eq!(response.headers.get("x-plain"), Some("kept"));
        assert!(response.cause.is_none());
    }

    #[test]
    fn test_unary_error_json() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let body = br#"{"code":"permission_denied","message":"not yours","details":[{"type":"acl.Denial","value":"AQID"}]}"#;
        let mut response = ok_response(Bytes::from_static(body));
        response.code = Code::from_http_status(403);
        response.tracing.http_status = Some(403);
        let response = (f.response)(response);

        let error = response.cause.unwrap();
        assert_eq!(error.code(), Code::PermissionDenied);
        assert_eq!(error.message(), Some("not yours"));
        assert_eq!(error.details().len(), 1);
        assert_eq!(error.details()[0].type_url(), "acl.Denial");
        assert_eq!(error.details()[0].value(), &[1, 2, 3]);
        assert_eq!(response.code, Code::PermissionDenied);
    }

    #[test]
    fn test_unary_error_falls_back_to_http_status() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let mut response = ok_response(Bytes::from_static(b"<html>bad gateway</html>"));
        response.code = Code::from_http_status(502);
        response.tracing.http_status = Some(502);
        let response = (f.response)(response);

        let error = response.cause.unwrap();
        assert_eq!(error.code(), Code::Unavailable);
        assert!(error.message().unwrap().contains("bad gateway"));
    }

    #[test]
    fn test_unary_success_decompression() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let pool = GzipCompressionPool::default();
        let compressed = pool.compress(b"clear text").unwrap();
        let mut response = ok_response(compressed);
        response.headers.insert("content-encoding", "gzip");
        let response = (f.response)(response);

        assert!(response.cause.is_none());
        assert_eq!(&response.message[..], b"clear text");
    }

    #[test]
    fn test_unary_unknown_encoding() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.unary_function();

        let mut response = ok_response(Bytes::from_static(b"???"));
        response.headers.insert("content-encoding", "snappy");
        let response = (f.response)(response);

        let error = response.cause.unwrap();
        assert_eq!(error.code(), Code::Internal);
        assert!(error.message().unwrap().contains("unknown compression"));
    }

    #[test]
    fn test_stream_request_headers() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.stream_function();

        let mut request = unary_request(b"");
        request.message = None;
        request.descriptor.stream_kind = StreamKind::BidiStream;
        let request = (f.request)(request).unwrap();

        assert_eq!(
            request.headers.get("content-type"),
            Some("application/connect+proto")
        );
        assert_eq!(request.headers.get("connect-accept-encoding"), Some("gzip"));
        assert!(request.headers.get("connect-content-encoding").is_none());
    }

    #[test]
    fn test_stream_end_stream_frame_with_metadata() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.stream_function();

        let _ = (f.stream_result)(StreamResult::Headers(Headers::new()));

        let frame = {
            let payload = br#"{"metadata":{"k":["v"]}}"#;
            let mut frame = vec![0x02];
            frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            frame.extend_from_slice(payload);
            Bytes::from(frame)
        };
        let result = (f.stream_result)(StreamResult::Message(frame));

        match result {
            StreamResult::Complete(completion) => {
                assert!(completion.is_ok());
                assert_eq!(completion.trailers.get("k"), Some("v"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_end_stream_frame_with_error() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.stream_function();

        let payload =
            br#"{"error":{"code":"resource_exhausted","message":"too much"}}"#;
        let mut frame = vec![0x02];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let result = (f.stream_result)(StreamResult::Message(Bytes::from(frame)));
        match result {
            StreamResult::Complete(completion) => {
                assert_eq!(completion.code, Code::ResourceExhausted);
                assert_eq!(completion.error.unwrap().message(), Some("too much"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_message_round_trip_with_compression() {
        let config = Arc::new(
            ProtocolClientConfig::new(
                "https://example.com",
                Arc::new(StubStrategy { name: "proto" }),
            )
            .request_compression(RequestCompression::new(
                1,
                Arc::new(GzipCompressionPool::default()),
            )),
        );
        let interceptor = ConnectInterceptor::new(config);
        let mut f = interceptor.stream_function();

        // Outbound: pack compresses and sets flag bit 0.
        let frame = (f.request_body)(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(frame[0] & 0x01, 0x01);

        // Inbound: announce gzip, then feed the same frame back through.
        let mut headers = Headers::new();
        headers.insert("connect-content-encoding", "gzip");
        let _ = (f.stream_result)(StreamResult::Headers(headers));

        let result = (f.stream_result)(StreamResult::Message(frame));
        match result {
            StreamResult::Message(payload) => assert_eq!(&payload[..], b"hello"),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_stream_eof_without_end_stream_frame() {
        let interceptor = ConnectInterceptor::new(config());
        let mut f = interceptor.stream_function();

        let result =
            (f.stream_result)(StreamResult::Complete(Completion::ok(Headers::new())));
        match result {
            StreamResult::Complete(completion) => {
                assert_eq!(completion.code, Code::Unknown);
                assert!(
                    completion.error.unwrap().message().unwrap().contains("end-stream")
                );
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_end_stream_empty_payload() {
        let completion = parse_end_stream(b"");
        assert!(completion.is_ok());
        let completion = parse_end_stream(b"{}");
        assert!(completion.is_ok());
    }
}
