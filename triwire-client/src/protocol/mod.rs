//! The three protocol interceptors and their shared plumbing.
//!
//! Exactly one of these is installed per client, after all user
//! interceptors, based on
//! [`NetworkProtocol`](crate::config::NetworkProtocol). Each one owns the
//! full wire dialect: headers, framing, compression signalling, and where
//! its protocol hides the RPC status.

mod completion;
mod connect;
mod grpc;
mod grpc_web;

pub use connect::ConnectInterceptor;
pub use grpc::GrpcInterceptor;
pub use grpc_web::GrpcWebInterceptor;

use std::sync::Arc;
use std::time::Duration;

use triwire_core::{CompressionPool, ConnectError, Headers};

use crate::config::{GetConfiguration, ProtocolClientConfig};
use crate::request::{Idempotency, MethodDescriptor, StreamKind};

pub(crate) const CONTENT_TYPE: &str = "content-type";
pub(crate) const CONTENT_ENCODING: &str = "content-encoding";
pub(crate) const ACCEPT_ENCODING: &str = "accept-encoding";
pub(crate) const USER_AGENT: &str = "user-agent";

pub(crate) const CONNECT_PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
pub(crate) const CONNECT_PROTOCOL_VERSION: &str = "1";
pub(crate) const CONNECT_TIMEOUT_MS: &str = "connect-timeout-ms";
pub(crate) const CONNECT_STREAMING_CONTENT_ENCODING: &str = "connect-content-encoding";
pub(crate) const CONNECT_STREAMING_ACCEPT_ENCODING: &str = "connect-accept-encoding";

pub(crate) const GRPC_ENCODING: &str = "grpc-encoding";
pub(crate) const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub(crate) const GRPC_TIMEOUT: &str = "grpc-timeout";
pub(crate) const TE: &str = "te";

/// Sent when the caller did not provide a `User-Agent` of their own.
pub(crate) const DEFAULT_USER_AGENT: &str =
    concat!("triwire/", env!("CARGO_PKG_VERSION"));

/// Set the library User-Agent unless the caller already provided one
/// (looked up case-insensitively).
pub(crate) fn set_default_user_agent(headers: &mut Headers) {
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, DEFAULT_USER_AGENT);
    }
}

/// Render a deadline as whole milliseconds for the timeout headers.
/// Durations beyond ten digits of milliseconds are treated as no deadline.
pub(crate) fn timeout_millis(timeout: Duration) -> Option<String> {
    let millis = timeout.as_millis();
    if millis >= 10_000_000_000 {
        return None;
    }
    Some(millis.to_string())
}

/// Whether a unary call should be encoded as a Connect GET.
pub(crate) fn should_use_get(
    config: &ProtocolClientConfig,
    descriptor: &MethodDescriptor,
) -> bool {
    if descriptor.stream_kind != StreamKind::Unary {
        return false;
    }
    match config.get_configuration {
        GetConfiguration::Disabled => false,
        GetConfiguration::IdempotentOnly => {
            descriptor.idempotency == Idempotency::NoSideEffects
        }
        GetConfiguration::Always => true,
    }
}

/// Resolve the response compression pool named by `header`.
///
/// Absent, empty, and `identity` all mean uncompressed; any other name
/// must match a configured pool or the response is unusable.
pub(crate) fn response_pool(
    config: &ProtocolClientConfig,
    headers: &Headers,
    header: &str,
) -> Result<Option<Arc<dyn CompressionPool>>, ConnectError> {
    match headers.get(header) {
        None | Some("") | Some("identity") => Ok(None),
        Some(name) => config.pool_named(name).map(Some).ok_or_else(|| {
            ConnectError::protocol(format!("unknown compression \"{name}\""))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use triwire_core::{ErrorDetail, ErrorDetailParser, SerializationStrategy};

    pub(crate) struct StubStrategy {
        pub name: &'static str,
    }

    impl SerializationStrategy for StubStrategy {
        fn serialization_name(&self) -> &'static str {
            self.name
        }

        fn error_detail_parser(&self) -> Arc<dyn ErrorDetailParser> {
            Arc::new(StubParser)
        }
    }

    pub(crate) struct StubParser;

    impl ErrorDetailParser for StubParser {
        fn parse_details(&self, _bytes: &[u8]) -> Vec<ErrorDetail> {
            vec![ErrorDetail::new("type", b"value".to_vec())]
        }

        fn serialize_details(
            &self,
            _details: &[ErrorDetail],
        ) -> Result<bytes::Bytes, ConnectError> {
            Ok(bytes::Bytes::new())
        }
    }

    #[test]
    fn test_default_user_agent_only_when_absent() {
        let mut headers = Headers::new();
        set_default_user_agent(&mut headers);
        assert_eq!(headers.get("user-agent"), Some(DEFAULT_USER_AGENT));

        let mut headers = Headers::new();
        headers.insert("User-Agent", "my-custom-user-agent");
        set_default_user_agent(&mut headers);
        assert_eq!(headers.get("user-agent"), Some("my-custom-user-agent"));
    }

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(Duration::from_secs(30)).as_deref(), Some("30000"));
        assert_eq!(timeout_millis(Duration::from_millis(250)).as_deref(), Some("250"));
        // Beyond ten digits of milliseconds: treated as unbounded.
        assert!(timeout_millis(Duration::from_secs(20_000_000_000)).is_none());
    }

    #[test]
    fn test_response_pool_lookup() {
        let config = ProtocolClientConfig::new(
            "https://h",
            Arc::new(StubStrategy { name: "proto" }),
        );

        let mut headers = Headers::new();
        assert!(response_pool(&config, &headers, CONTENT_ENCODING).unwrap().is_none());

        headers.insert(CONTENT_ENCODING, "identity");
        assert!(response_pool(&config, &headers, CONTENT_ENCODING).unwrap().is_none());

        headers.insert(CONTENT_ENCODING, "gzip");
        let pool = response_pool(&config, &headers, CONTENT_ENCODING).unwrap();
        assert_eq!(pool.unwrap().name(), "gzip");

        headers.insert(CONTENT_ENCODING, "snappy");
        let err = response_pool(&config, &headers, CONTENT_ENCODING).unwrap_err();
        assert_eq!(err.code(), triwire_core::Code::Internal);
        assert!(err.message().unwrap().contains("unknown compression"));
    }
}
