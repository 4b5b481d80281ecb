//! Hyper-based HTTP transport.

use std::time::Duration;

use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
#[cfg(feature = "tls")]
use rustls::ClientConfig;

use super::connector::{Connector, build_connector};
use crate::conn::{ChannelBody, ConnError};
use crate::error::BuildError;

/// Outgoing exchanges for every stream a [`Client`](crate::Client) opens.
///
/// Each call's request body is a [`ChannelBody`] the stream writes into, and
/// the response body is handed to the stream's pump task as soon as the head
/// arrives. Clones share one connection pool.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<Connector, ChannelBody>,
    http2_only: bool,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("http2_only", &self.http2_only)
            .finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    /// Open one exchange and wait for the response head. The request body
    /// keeps streaming after this returns.
    pub async fn request(
        &self,
        request: http::Request<ChannelBody>,
    ) -> Result<http::Response<Incoming>, ConnError> {
        self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                ConnError::Transport(format!("connect failed: {e}"))
            } else {
                ConnError::Transport(format!("exchange failed: {e}"))
            }
        })
    }

    /// Whether every exchange runs over HTTP/2, which full-duplex calls
    /// need on cleartext connections.
    pub fn is_http2_only(&self) -> bool {
        self.http2_only
    }
}

/// Connection reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PoolSettings {
    idle_timeout: Option<Duration>,
    max_idle_per_host: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle_per_host: 32,
        }
    }
}

/// Flow control and liveness of HTTP/2 connections. Long-lived streams that
/// sit idle between messages rely on keep-alive pings to notice a dead peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Http2Settings {
    prior_knowledge: bool,
    adaptive_window: bool,
    stream_window: Option<u32>,
    connection_window: Option<u32>,
    keep_alive_interval: Option<Duration>,
    keep_alive_timeout: Option<Duration>,
}

/// Builder for [`HyperTransport`].
///
/// # Example
///
/// ```ignore
/// use connectrpc_duplex::HyperTransport;
/// use std::time::Duration;
///
/// let transport = HyperTransport::builder()
///     .http2_only(true)
///     .http2_keep_alive(Duration::from_secs(20), Duration::from_secs(5))
///     .connect_timeout(Duration::from_secs(3))
///     .build()?;
/// ```
#[derive(Default)]
pub struct HyperTransportBuilder {
    #[cfg(feature = "tls")]
    tls_config: Option<ClientConfig>,
    connect_timeout: Option<Duration>,
    pool: PoolSettings,
    h2: Http2Settings,
}

impl HyperTransportBuilder {
    /// Use a custom TLS configuration (custom roots, client certificates).
    ///
    /// Without one, [`default_tls_config`](super::default_tls_config) is used.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: ClientConfig) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Speak HTTP/2 on every connection. Cleartext bidirectional streams
    /// need this (h2c); over TLS, ALPN picks the version.
    pub fn http2_only(mut self, enabled: bool) -> Self {
        self.h2.prior_knowledge = enabled;
        self
    }

    /// Give up on establishing a connection after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Close pooled connections idle for longer than `timeout`, or never
    /// with `None`. Default: 90 seconds.
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    /// Default: 32.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool.max_idle_per_host = max;
        self
    }

    /// Size the HTTP/2 flow-control windows from measured bandwidth-delay
    /// instead of fixed values.
    pub fn http2_adaptive_window(mut self, enabled: bool) -> Self {
        self.h2.adaptive_window = enabled;
        self
    }

    /// Fixed HTTP/2 windows, per stream and per connection.
    pub fn http2_windows(mut self, stream: u32, connection: u32) -> Self {
        self.h2.stream_window = Some(stream);
        self.h2.connection_window = Some(connection);
        self
    }

    /// Ping every `interval` and drop the connection when a ping goes
    /// unanswered for `timeout`.
    pub fn http2_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.h2.keep_alive_interval = Some(interval);
        self.h2.keep_alive_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HyperTransport, BuildError> {
        #[cfg(feature = "tls")]
        let connector = build_connector(self.tls_config, self.connect_timeout)?;
        #[cfg(not(feature = "tls"))]
        let connector = build_connector(self.connect_timeout);

        let mut builder = Client::builder(TokioExecutor::new());
        // The idle timeout only fires with a timer installed.
        builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(self.pool.idle_timeout)
            .pool_max_idle_per_host(self.pool.max_idle_per_host);

        let h2 = self.h2;
        builder.http2_only(h2.prior_knowledge);
        if h2.adaptive_window {
            builder.http2_adaptive_window(true);
        } else {
            builder
                .http2_initial_stream_window_size(h2.stream_window)
                .http2_initial_connection_window_size(h2.connection_window);
        }
        if let Some(interval) = h2.keep_alive_interval {
            builder
                .timer(TokioTimer::new())
                .http2_keep_alive_interval(interval)
                .http2_keep_alive_while_idle(true);
        }
        if let Some(timeout) = h2.keep_alive_timeout {
            builder.http2_keep_alive_timeout(timeout);
        }

        Ok(HyperTransport {
            client: builder.build(connector),
            http2_only: h2.prior_knowledge,
        })
    }
}

impl std::fmt::Debug for HyperTransportBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("HyperTransportBuilder");
        #[cfg(feature = "tls")]
        debug.field("custom_tls", &self.tls_config.is_some());
        debug
            .field("connect_timeout", &self.connect_timeout)
            .field("pool", &self.pool)
            .field("h2", &self.h2)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let builder = HyperTransportBuilder::default();
        assert_eq!(builder.pool, PoolSettings::default());
        assert_eq!(builder.pool.idle_timeout, Some(Duration::from_secs(90)));
        assert!(!builder.h2.prior_knowledge);
        assert!(builder.connect_timeout.is_none());
    }

    #[test]
    fn test_http2_settings() {
        let builder = HyperTransport::builder()
            .http2_windows(1 << 20, 4 << 20)
            .http2_keep_alive(Duration::from_secs(10), Duration::from_secs(5))
            .pool_idle_timeout(None);

        assert_eq!(builder.h2.stream_window, Some(1 << 20));
        assert_eq!(builder.h2.connection_window, Some(4 << 20));
        assert_eq!(builder.h2.keep_alive_interval, Some(Duration::from_secs(10)));
        assert_eq!(builder.h2.keep_alive_timeout, Some(Duration::from_secs(5)));
        assert!(builder.pool.idle_timeout.is_none());
    }

    #[tokio::test]
    async fn test_build_http2_only() {
        let transport = HyperTransport::builder()
            .http2_only(true)
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        assert!(transport.is_http2_only());
    }
}
