//! Status extraction shared by the gRPC and gRPC-Web interceptors.
//!
//! Both protocols report the RPC outcome in a trailer block:
//! `grpc-status` (numeric code), `grpc-message` (percent-encoded UTF-8),
//! and `grpc-status-details-bin` (base64 of a serialized
//! `google.rpc.Status`). gRPC delivers the block as HTTP trailers;
//! gRPC-Web delivers it as an HTTP/1.1-style header block inside the
//! final envelope.

use base64::Engine;
use triwire_core::{
    Code, Completion, ConnectError, ErrorDetailParser, Headers,
};

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
pub(crate) const GRPC_STATUS_DETAILS_BIN: &str = "grpc-status-details-bin";

/// Parse a completion out of a trailer block.
///
/// Returns `None` when the block carries no `grpc-status` at all, which
/// callers treat as "the stream ended without a status".
pub(crate) fn completion_from_trailers(
    trailers: &Headers,
    parser: &dyn ErrorDetailParser,
) -> Option<Completion> {
    let status = trailers.get(GRPC_STATUS)?;
    let code = status
        .trim()
        .parse::<i32>()
        .map(Code::from_value)
        .unwrap_or(Code::Unknown);

    if code == Code::Ok {
        return Some(Completion::ok(trailers.clone()));
    }

    let message = trailers.get(GRPC_MESSAGE).map(percent_decode);

    let details = trailers
        .get(GRPC_STATUS_DETAILS_BIN)
        .and_then(decode_base64_value)
        .map(|bytes| parser.parse_details(&bytes))
        .unwrap_or_default();

    let mut error = match message {
        Some(message) => ConnectError::new(code, message),
        None => ConnectError::from_code(code),
    };
    error = error.with_details(details).with_metadata(trailers.clone());

    Some(Completion::from_error_with_trailers(error, trailers.clone()))
}

/// Parse a gRPC-Web trailer frame payload: an ASCII header block of
/// `key: value\r\n` lines.
pub(crate) fn parse_trailer_block(payload: &[u8]) -> Headers {
    let mut trailers = Headers::new();
    let text = String::from_utf8_lossy(payload);
    for line in text.split("\r\n") {
        let line = line.trim_end_matches('\n').trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            trailers.append(key.trim(), value.trim());
        }
    }
    trailers
}

/// Decode a `-bin` trailer value. gRPC allows both padded and unpadded
/// base64 on the wire.
pub(crate) fn decode_base64_value(value: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(value)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(value))
        .ok()
}

/// Decode the percent-encoding used by `grpc-message`. Invalid escapes
/// pass through unchanged rather than failing the whole message.
pub(crate) fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3])
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
