//! Duplex stream engine for Connect, gRPC and gRPC-Web.
//!
//! Every call, client or handler side, is a [`DuplexStream`]: independent
//! send and receive halves over one HTTP exchange, a half-close, and a
//! single teardown path shared by [`close`](DuplexStream::close) and the
//! call's [`CallContext`]. The wire differences between the protocols live
//! in the protocol adapters of `connectrpc-duplex-core`; the engine only
//! asks whether the body is enveloped and which side of the exchange it is.
//!
//! ## Client
//!
//! ```ignore
//! use connectrpc_duplex::{CallOptions, Client, ClientProtocol};
//! use std::time::Duration;
//!
//! let client = Client::builder("http://localhost:3000")
//!     .protocol(ClientProtocol::Grpc)
//!     .http2_prior_knowledge()
//!     .build()?;
//!
//! let stream = client.call_bidi_stream::<EchoRequest, EchoResponse>(
//!     "echo.v1.EchoService/Echo",
//! )?;
//! stream.send(&EchoRequest { message: "hello".into() }).await?;
//! stream.close_send();
//! while let Some(reply) = stream.receive().await? {
//!     println!("{}", reply.message);
//! }
//! stream.close().await?;
//! ```
//!
//! ## Cancellation
//!
//! A stream is cancelled when its context's token is cancelled, its
//! deadline passes, or [`DuplexStream::cancel`] is called. Cancellation
//! unblocks every pending `send` and `receive`, resets the HTTP exchange and
//! is observed by every later operation. `close` racing a cancellation tears
//! the exchange down exactly once:
//!
//! ```ignore
//! let ctx = CallContext::new();
//! let options = CallOptions::new()
//!     .context(ctx.clone())
//!     .timeout(Duration::from_secs(30));
//! let stream = client
//!     .call_server_stream_with_options::<CountUpRequest, CountUpResponse>(
//!         "count.v1.CountService/CountUp",
//!         &CountUpRequest { number: 5 },
//!         options,
//!     )
//!     .await?;
//! ctx.cancel();
//! assert!(stream.close().await.is_err());
//! ```
//!
//! ## Handler
//!
//! [`serve_stream`] answers a request inside an axum route; see the
//! [`handler`] module.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `tls` (default) | rustls via hyper-rustls with the webpki roots |
//! | `compression-zstd` | Zstandard message compression |
//! | `compression-full` | Every compression algorithm |
//!
//! Gzip is always available through the core crate's default features.

mod client;
pub mod conn;
mod context;
mod duplex;
mod error;
pub mod handler;
mod options;
pub mod transport;

pub use client::{
    BidiStream, Client, ClientBuilder, ClientProtocol, ClientStream, Response, ServerStream,
};
pub use conn::{ChannelBody, ClientConn, Conn, ConnError, ConnHooks, HandlerConn, PeerHead};
pub use context::{CallContext, CancelReason};
pub use duplex::{DEFAULT_CLOSE_TIMEOUT, DuplexStream, Role, StreamConfig, StreamState};
pub use error::{BuildError, StreamError};
pub use handler::{HandlerStream, serve_stream};
pub use options::CallOptions;
pub use transport::{HyperTransport, HyperTransportBuilder};

pub use connectrpc_duplex_core::{
    Code, CompressionConfig, CompressionEncoding, ErrorDetail, JsonCodec, MessageCodec, Metadata,
    ProtoCodec, Protocol, Status,
};

pub use bytes::Bytes;
