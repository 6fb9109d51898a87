//! The protocol client: one uniform surface over three wire protocols.

use std::sync::Arc;

use http::Uri;
use tracing::debug;
use triwire_core::{Code, ConnectError, Headers};

use crate::config::{NetworkProtocol, ProtocolClientConfig};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::protocol::{ConnectInterceptor, GrpcInterceptor, GrpcWebInterceptor};
use crate::request::{HttpRequest, MethodSpec};
use crate::response::{HttpResponse, ResponseMessage};
use crate::stream::{BidirectionalStream, ClientOnlyStream, ServerOnlyStream};
use crate::transport::HttpClientInterface;

/// An RPC client bound to one host, one protocol, and one serialization
/// strategy.
///
/// Construction installs the interceptor chain: user interceptors in
/// registration order, then the protocol interceptor picked by
/// [`NetworkProtocol`], nearest the transport. Every call issues exactly
/// one HTTP attempt.
pub struct ProtocolClient {
    config: Arc<ProtocolClientConfig>,
    transport: Arc<dyn HttpClientInterface>,
    chain: InterceptorChain,
}

impl ProtocolClient {
    pub fn new(
        transport: Arc<dyn HttpClientInterface>,
        config: ProtocolClientConfig,
    ) -> Self {
        let config = Arc::new(config);

        let mut interceptors: Vec<Arc<dyn Interceptor>> = config
            .interceptors
            .iter()
            .map(|factory| factory(config.clone()))
            .collect();
        interceptors.push(match config.network_protocol {
            NetworkProtocol::Connect => Arc::new(ConnectInterceptor::new(config.clone())),
            NetworkProtocol::Grpc => Arc::new(GrpcInterceptor::new(config.clone())),
            NetworkProtocol::GrpcWeb => Arc::new(GrpcWebInterceptor::new(config.clone())),
        });

        Self {
            chain: InterceptorChain::new(interceptors),
            config,
            transport,
        }
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    /// Perform a unary call.
    ///
    /// Never fails at the function level: transport, protocol, and remote
    /// failures all land in the returned message's `result`.
    pub async fn unary<Req, Res>(
        &self,
        message: &Req,
        headers: Headers,
        spec: &MethodSpec<Req, Res>,
    ) -> ResponseMessage<Res> {
        debug!(rpc.method = %spec.path, rpc.type = "unary", "dispatching call");
        match self.unary_inner(message, headers, spec).await {
            Ok(response) => response,
            Err(error) => ResponseMessage {
                headers: Headers::new(),
                trailers: Headers::new(),
                result: Err(error),
            },
        }
    }

    async fn unary_inner<Req, Res>(
        &self,
        message: &Req,
        headers: Headers,
        spec: &MethodSpec<Req, Res>,
    ) -> Result<ResponseMessage<Res>, ConnectError> {
        let descriptor = spec.descriptor();

        // GET-eligible calls need byte-stable output: the message becomes
        // part of the URL.
        let use_get = self.config.network_protocol == NetworkProtocol::Connect
            && crate::protocol::should_use_get(&self.config, &descriptor);
        let body = if use_get {
            spec.request_codec.deterministic_serialize(message)?
        } else {
            spec.request_codec.serialize(message)?
        };

        let request = HttpRequest {
            uri: assemble_url(&self.config.host, &spec.path)?,
            method: http::Method::POST,
            headers,
            message: Some(body),
            descriptor,
        };

        let mut functions = self.chain.unary_function();
        let request = (functions.request)(request)?;

        let exchange = self.transport.unary(request);
        let response = match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| {
                    HttpResponse::from_error(ConnectError::new(
                        Code::DeadlineExceeded,
                        "deadline exceeded",
                    ))
                }),
            None => exchange.await,
        };

        let response = (functions.response)(response);

        let result = match response.cause {
            Some(error) => Err(error),
            None => spec.response_codec.deserialize(&response.message),
        };
        Ok(ResponseMessage {
            headers: response.headers,
            trailers: response.trailers,
            result,
        })
    }

    /// Open a bidirectional stream.
    pub async fn bidi_stream<Req, Res>(
        &self,
        headers: Headers,
        spec: &MethodSpec<Req, Res>,
    ) -> Result<BidirectionalStream<Req, Res>, ConnectError>
    where
        Res: Send + 'static,
    {
        debug!(rpc.method = %spec.path, rpc.type = "stream", "opening stream");

        let request = HttpRequest {
            uri: assemble_url(&self.config.host, &spec.path)?,
            method: http::Method::POST,
            headers,
            message: None,
            descriptor: spec.descriptor(),
        };

        let mut functions = self.chain.stream_function();
        let request = (functions.request)(request)?;

        let transport_stream = self.transport.open_stream(request).await?;
        let deadline = self
            .config
            .timeout
            .map(|t| tokio::time::Instant::now() + t);

        Ok(BidirectionalStream::spawn(
            transport_stream,
            functions,
            spec.request_codec.clone(),
            spec.response_codec.clone(),
            deadline,
        ))
    }

    /// Open a server stream: the single request is sent and the send half
    /// closed before the handle is returned.
    pub async fn server_stream<Req, Res>(
        &self,
        message: &Req,
        headers: Headers,
        spec: &MethodSpec<Req, Res>,
    ) -> Result<ServerOnlyStream<Req, Res>, ConnectError>
    where
        Res: Send + 'static,
    {
        let stream = self.bidi_stream(headers, spec).await?;
        stream.send(message).await?;
        stream.send_close().await?;
        Ok(ServerOnlyStream::new(stream))
    }

    /// Open a client stream; the response arrives from
    /// [`ClientOnlyStream::close_and_receive`].
    pub async fn client_stream<Req, Res>(
        &self,
        headers: Headers,
        spec: &MethodSpec<Req, Res>,
    ) -> Result<ClientOnlyStream<Req, Res>, ConnectError>
    where
        Res: Send + 'static,
    {
        Ok(ClientOnlyStream::new(self.bidi_stream(headers, spec).await?))
    }
}

/// `rtrim(host, '/') + '/' + path`, for any host with or without a
/// trailing slash.
fn assemble_url(host: &str, path: &str) -> Result<Uri, ConnectError> {
    let url = format!("{}/{}", host.trim_end_matches('/'), path);
    url.parse()
        .map_err(|e| ConnectError::protocol(format!("invalid request url {url:?}: {e}")))
}
