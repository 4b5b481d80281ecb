//! HTTP transport for outgoing calls.
//!
//! [`HyperTransport`] sends requests through hyper_util's legacy client. It
//! supports:
//!
//! - HTTP/1.1 and HTTP/2, negotiated via ALPN over TLS
//! - HTTP/2 with prior knowledge (h2c) through `http2_only`
//! - TLS with rustls (feature `tls`, on by default)
//! - Connection pooling, connect timeouts and HTTP/2 keep-alive
//!
//! A connection is returned to the pool only after the response body has
//! been read to the end or dropped, so aborting a call's pump task is what
//! releases the connection.
//!
//! # Example
//!
//! ```ignore
//! use connectrpc_duplex::HyperTransport;
//! use std::time::Duration;
//!
//! let transport = HyperTransport::builder()
//!     .http2_only(true)
//!     .pool_idle_timeout(Some(Duration::from_secs(60)))
//!     .build()?;
//! ```

mod connector;
mod hyper;

#[cfg(feature = "tls")]
pub use connector::default_tls_config;
pub use hyper::{HyperTransport, HyperTransportBuilder};
