//! Client for Connect, gRPC and gRPC-Web calls.
//!
//! A [`Client`] opens one [`DuplexStream`] per call and hands it out wrapped
//! in a typed stream: [`BidiStream`], [`ServerStream`] or [`ClientStream`],
//! or runs a whole unary exchange with [`Client::call_unary`].
//!
//! # Example
//!
//! ```ignore
//! use connectrpc_duplex::{Client, ClientProtocol};
//!
//! let client = Client::builder("http://localhost:3000")
//!     .protocol(ClientProtocol::Grpc)
//!     .http2_prior_knowledge()
//!     .build()?;
//!
//! let stream = client
//!     .call_server_stream::<CountUpRequest, CountUpResponse>(
//!         "count.v1.CountService/CountUp",
//!         &CountUpRequest { number: 10 },
//!     )
//!     .await?;
//! while let Some(item) = stream.receive().await? {
//!     println!("{}", item.number);
//! }
//! stream.close().await?;
//! ```

mod streams;

use std::time::Duration;

use connectrpc_duplex_core::{
    CallInfo, CompressionConfig, CompressionEncoding, JsonCodec, MessageCodec, Protocol,
    ProtoCodec, Status,
};
use http::{Method, Uri};
use tracing::info_span;

use crate::conn::{ClientConn, ConnHooks};
use crate::duplex::{DuplexStream, Role, StreamConfig};
use crate::error::{BuildError, StreamError};
use crate::options::CallOptions;
use crate::transport::HyperTransport;

pub use streams::{BidiStream, ClientStream, Response, ServerStream};

/// Wire protocol a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientProtocol {
    /// Connect: unary calls use the unary variant, streaming calls the
    /// enveloped one.
    #[default]
    Connect,
    /// gRPC; needs HTTP/2.
    Grpc,
    GrpcWeb,
}

impl ClientProtocol {
    fn resolve(self, unary: bool) -> Protocol {
        match self {
            ClientProtocol::Connect if unary => Protocol::ConnectUnary,
            ClientProtocol::Connect => Protocol::ConnectStream,
            ClientProtocol::Grpc => Protocol::Grpc,
            ClientProtocol::GrpcWeb => Protocol::GrpcWeb,
        }
    }
}

/// RPC client bound to one base URL.
///
/// Cloning is cheap; clones share the transport's connection pool.
#[derive(Debug, Clone)]
pub struct Client<C = ProtoCodec> {
    base_url: String,
    transport: HyperTransport,
    protocol: ClientProtocol,
    codec: C,
    config: StreamConfig,
    default_timeout: Option<Duration>,
    hooks: ConnHooks,
}

impl Client<ProtoCodec> {
    pub fn builder<S: Into<String>>(base_url: S) -> ClientBuilder<ProtoCodec> {
        ClientBuilder::new(base_url)
    }
}

impl<C: Clone + Send + Sync + 'static> Client<C> {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn protocol(&self) -> ClientProtocol {
        self.protocol
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open a raw stream for `procedure` (`"package.Service/Method"`).
    ///
    /// The request head goes out as soon as the runtime polls the stream's
    /// pump task; messages follow as they are sent.
    pub fn open(
        &self,
        procedure: &str,
        codec_name: &str,
        unary: bool,
        options: CallOptions,
    ) -> Result<DuplexStream<ClientConn>, StreamError> {
        let protocol = self.protocol.resolve(unary);
        let adapter = protocol.adapter();

        let (ctx, metadata) = options.into_call(self.default_timeout);

        let accept = CompressionEncoding::accept_header();
        let call = CallInfo {
            codec: codec_name,
            timeout: ctx.remaining(),
            send_encoding: self.config.compression.encoding,
            accept_encoding: accept.as_deref(),
        };
        let mut headers = adapter.request_headers(&call)?;
        for (name, value) in metadata.iter() {
            headers.append(name.clone(), value.clone());
        }

        let uri = format!("{}/{}", self.base_url, procedure.trim_start_matches('/'));
        let uri: Uri = uri
            .parse()
            .map_err(|e| Status::invalid_argument(format!("invalid procedure {procedure:?}: {e}")))?;
        let (mut parts, ()) = http::Request::new(()).into_parts();
        parts.method = Method::POST;
        parts.uri = uri;
        parts.headers = headers;

        let span = info_span!(
            "rpc.call",
            rpc.method = %procedure,
            rpc.protocol = %protocol,
            rpc.codec = %codec_name,
            otel.kind = "client",
        );
        let conn = ClientConn::start(
            self.transport.clone(),
            parts,
            self.config.buffer,
            self.hooks.clone(),
            span.clone(),
        );
        Ok(DuplexStream::new(
            conn,
            protocol,
            Role::Client,
            codec_name,
            self.config.clone(),
            ctx,
            span,
        ))
    }

    pub async fn call_unary<Req, Res>(
        &self,
        procedure: &str,
        request: &Req,
    ) -> Result<Response<Res>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        self.call_unary_with_options(procedure, request, CallOptions::default())
            .await
    }

    /// Run a unary call: one request, one response.
    pub async fn call_unary_with_options<Req, Res>(
        &self,
        procedure: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<Response<Res>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        let name = MessageCodec::<Req>::name(&self.codec);
        let stream = self.open(procedure, name, true, options)?;
        let call = ClientStream::<Req, Res, C>::new(stream, self.codec.clone());
        match call.send(request).await {
            // The server answered without reading the request; its answer
            // carries the reason.
            Ok(()) | Err(StreamError::ConnClosed) => {}
            Err(err) => return Err(err),
        }
        call.close_and_receive().await
    }

    pub async fn call_server_stream<Req, Res>(
        &self,
        procedure: &str,
        request: &Req,
    ) -> Result<ServerStream<Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        self.call_server_stream_with_options(procedure, request, CallOptions::default())
            .await
    }

    /// Send one request and stream the responses.
    pub async fn call_server_stream_with_options<Req, Res>(
        &self,
        procedure: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<ServerStream<Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        let message = MessageCodec::<Req>::marshal(&self.codec, request)?;
        let name = MessageCodec::<Req>::name(&self.codec);
        let stream = self.open(procedure, name, false, options)?;
        match stream.send(message).await {
            Ok(()) | Err(StreamError::ConnClosed) => {}
            Err(err) => {
                let _ = stream.close().await;
                return Err(err);
            }
        }
        stream.close_send();
        Ok(ServerStream::new(stream, self.codec.clone()))
    }

    pub fn call_client_stream<Req, Res>(
        &self,
        procedure: &str,
    ) -> Result<ClientStream<Req, Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        self.call_client_stream_with_options(procedure, CallOptions::default())
    }

    /// Stream requests, then receive a single response.
    pub fn call_client_stream_with_options<Req, Res>(
        &self,
        procedure: &str,
        options: CallOptions,
    ) -> Result<ClientStream<Req, Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        let name = MessageCodec::<Req>::name(&self.codec);
        let stream = self.open(procedure, name, false, options)?;
        Ok(ClientStream::new(stream, self.codec.clone()))
    }

    pub fn call_bidi_stream<Req, Res>(
        &self,
        procedure: &str,
    ) -> Result<BidiStream<Req, Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        self.call_bidi_stream_with_options(procedure, CallOptions::default())
    }

    /// Open a bidirectional stream. Over cleartext this needs an HTTP/2
    /// transport (`http2_prior_knowledge`).
    pub fn call_bidi_stream_with_options<Req, Res>(
        &self,
        procedure: &str,
        options: CallOptions,
    ) -> Result<BidiStream<Req, Res, C>, StreamError>
    where
        C: MessageCodec<Req> + MessageCodec<Res>,
    {
        let name = MessageCodec::<Req>::name(&self.codec);
        let stream = self.open(procedure, name, false, options)?;
        Ok(BidiStream::new(stream, self.codec.clone()))
    }
}

/// Builder for a [`Client`].
///
/// # Example
///
/// ```ignore
/// use connectrpc_duplex::{Client, ClientProtocol, CompressionEncoding};
///
/// let client = Client::builder("http://localhost:3000")
///     .protocol(ClientProtocol::GrpcWeb)
///     .send_compression(CompressionEncoding::Gzip)
///     .use_json()
///     .build()?;
/// ```
#[derive(Debug)]
pub struct ClientBuilder<C = ProtoCodec> {
    base_url: String,
    transport: Option<HyperTransport>,
    protocol: ClientProtocol,
    codec: C,
    config: StreamConfig,
    default_timeout: Option<Duration>,
    http2_prior_knowledge: bool,
    hooks: ConnHooks,
}

impl ClientBuilder<ProtoCodec> {
    /// The base URL includes the scheme and host, e.g. `http://localhost:3000`.
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            transport: None,
            protocol: ClientProtocol::default(),
            codec: ProtoCodec,
            config: StreamConfig::default(),
            default_timeout: None,
            http2_prior_knowledge: false,
            hooks: ConnHooks::default(),
        }
    }
}

impl<C> ClientBuilder<C> {
    pub fn protocol(mut self, protocol: ClientProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Use another message codec.
    pub fn codec<C2>(self, codec: C2) -> ClientBuilder<C2> {
        ClientBuilder {
            base_url: self.base_url,
            transport: self.transport,
            protocol: self.protocol,
            codec,
            config: self.config,
            default_timeout: self.default_timeout,
            http2_prior_knowledge: self.http2_prior_knowledge,
            hooks: self.hooks,
        }
    }

    pub fn use_json(self) -> ClientBuilder<JsonCodec> {
        self.codec(JsonCodec)
    }

    pub fn use_proto(self) -> ClientBuilder<ProtoCodec> {
        self.codec(ProtoCodec)
    }

    pub fn compression(mut self, config: CompressionConfig) -> Self {
        self.config.compression = config;
        self
    }

    /// Compress request messages with `encoding`.
    pub fn send_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.config.compression.encoding = encoding;
        self
    }

    pub fn read_max_bytes(mut self, limit: usize) -> Self {
        self.config.read_max_bytes = Some(limit);
        self
    }

    pub fn send_max_bytes(mut self, limit: usize) -> Self {
        self.config.send_max_bytes = Some(limit);
        self
    }

    /// Bound on waiting for the transport to release a closed stream when
    /// the call has no deadline.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Default timeout for every call; [`CallOptions::timeout`] overrides it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Speak HTTP/2 without TLS (h2c). Ignored when a transport is supplied.
    pub fn http2_prior_knowledge(mut self) -> Self {
        self.http2_prior_knowledge = true;
        self
    }

    /// Observe the request and response heads of every call.
    pub fn hooks(mut self, hooks: ConnHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn transport(mut self, transport: HyperTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Client<C>, BuildError> {
        let base_url = self.base_url.trim_end_matches('/').to_string();
        let parsed: Uri = base_url
            .parse()
            .map_err(|e| BuildError::InvalidUrl(format!("{base_url}: {e}")))?;
        if parsed.scheme().is_none() || parsed.authority().is_none() {
            return Err(BuildError::InvalidUrl(base_url));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => HyperTransport::builder()
                .http2_only(self.http2_prior_knowledge)
                .build()?,
        };

        Ok(Client {
            base_url,
            transport,
            protocol: self.protocol,
            codec: self.codec,
            config: self.config,
            default_timeout: self.default_timeout,
            hooks: self.hooks,
        })
    }
}
