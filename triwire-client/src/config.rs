//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use triwire_core::{
    CompressionPool, GzipCompressionPool, RequestCompression, SerializationStrategy,
};

use crate::interceptor::Interceptor;

/// Which wire protocol the client speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkProtocol {
    #[default]
    Connect,
    Grpc,
    GrpcWeb,
}

/// When Connect unary calls are encoded as cacheable GET requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GetConfiguration {
    /// Always POST.
    #[default]
    Disabled,
    /// GET for methods marked as having no side effects.
    IdempotentOnly,
    /// GET for every unary method.
    Always,
}

/// Builds an interceptor for one client, given the final configuration.
pub type InterceptorFactory =
    Arc<dyn Fn(Arc<ProtocolClientConfig>) -> Arc<dyn Interceptor> + Send + Sync>;

/// Everything a [`ProtocolClient`](crate::client::ProtocolClient) needs:
/// target host, protocol selection, serialization, compression, deadline,
/// and user interceptors.
///
/// ```ignore
/// let config = ProtocolClientConfig::new("https://api.example.com", Arc::new(ProtoStrategy))
///     .network_protocol(NetworkProtocol::Grpc)
///     .request_compression(RequestCompression::new(1024, Arc::new(GzipCompressionPool::default())))
///     .timeout(Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct ProtocolClientConfig {
    /// Scheme and authority, e.g. `https://api.example.com`. A trailing
    /// slash is tolerated.
    pub host: String,
    pub serialization_strategy: Arc<dyn SerializationStrategy>,
    pub network_protocol: NetworkProtocol,
    /// Outbound compression; `None` sends everything uncompressed.
    pub request_compression: Option<RequestCompression>,
    /// Pools accepted for responses, advertised in preference order.
    pub compression_pools: Vec<Arc<dyn CompressionPool>>,
    pub get_configuration: GetConfiguration,
    /// Propagated to the server (`Connect-Timeout-Ms` / `Grpc-Timeout`)
    /// and enforced client-side as the call deadline.
    pub timeout: Option<Duration>,
    pub interceptors: Vec<InterceptorFactory>,
}

impl ProtocolClientConfig {
    pub fn new(host: impl Into<String>, strategy: Arc<dyn SerializationStrategy>) -> Self {
        Self {
            host: host.into(),
            serialization_strategy: strategy,
            network_protocol: NetworkProtocol::default(),
            request_compression: None,
            compression_pools: vec![Arc::new(GzipCompressionPool::default())],
            get_configuration: GetConfiguration::default(),
            timeout: None,
            interceptors: Vec::new(),
        }
    }

    pub fn network_protocol(mut self, protocol: NetworkProtocol) -> Self {
        self.network_protocol = protocol;
        self
    }

    pub fn request_compression(mut self, compression: RequestCompression) -> Self {
        self.request_compression = Some(compression);
        self
    }

    /// Replace the accepted response pools. An empty list disables the
    /// accept-encoding advertisement entirely.
    pub fn compression_pools(mut self, pools: Vec<Arc<dyn CompressionPool>>) -> Self {
        self.compression_pools = pools;
        self
    }

    pub fn get_configuration(mut self, get: GetConfiguration) -> Self {
        self.get_configuration = get;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a user interceptor. Interceptors run in registration
    /// order on requests; the protocol interceptor is appended after all
    /// of them.
    pub fn interceptor(mut self, factory: InterceptorFactory) -> Self {
        self.interceptors.push(factory);
        self
    }

    /// The encoding name of the configured strategy ("proto", "json", ...).
    pub fn codec_name(&self) -> &'static str {
        self.serialization_strategy.serialization_name()
    }

    /// Comma-separated pool names for accept-encoding headers, or `None`
    /// when no pools are registered.
    pub fn acceptable_compression(&self) -> Option<String> {
        if self.compression_pools.is_empty() {
            return None;
        }
        Some(
            self.compression_pools
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Look up a response pool by the server's chosen encoding name.
    /// `identity` and an empty name mean no compression.
    pub fn pool_named(&self, name: &str) -> Option<Arc<dyn CompressionPool>> {
        self.compression_pools
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }
}

impl std::fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("host", &self.host)
            .field("codec", &self.codec_name())
            .field("network_protocol", &self.network_protocol)
            .field("request_compression", &self.request_compression)
            .field(
                "compression_pools",
                &self.compression_pools.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("get_configuration", &self.get_configuration)
            .field("timeout", &self.timeout)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
