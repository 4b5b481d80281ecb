//! Connector setup for the hyper client.

use std::time::Duration;

use hyper_util::client::legacy::connect::HttpConnector;

#[cfg(feature = "tls")]
use std::sync::Arc;

#[cfg(feature = "tls")]
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
#[cfg(feature = "tls")]
use rustls::ClientConfig;

#[cfg(feature = "tls")]
use crate::error::BuildError;

/// Connector used by [`HyperTransport`](super::HyperTransport).
#[cfg(feature = "tls")]
pub(crate) type Connector = HttpsConnector<HttpConnector>;

/// Connector used by [`HyperTransport`](super::HyperTransport).
#[cfg(not(feature = "tls"))]
pub(crate) type Connector = HttpConnector;

/// Plain TCP connector that also accepts `https` URIs so a TLS layer can
/// wrap it.
pub(crate) fn build_http_connector(connect_timeout: Option<Duration>) -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(connect_timeout);
    http
}

/// TLS configuration with the ring provider and the bundled Mozilla roots.
#[cfg(feature = "tls")]
pub fn default_tls_config() -> Result<ClientConfig, BuildError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BuildError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(feature = "tls")]
pub(crate) fn build_connector(
    tls: Option<ClientConfig>,
    connect_timeout: Option<Duration>,
) -> Result<Connector, BuildError> {
    let tls = match tls {
        Some(config) => config,
        None => default_tls_config()?,
    };
    Ok(HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(build_http_connector(connect_timeout)))
}

#[cfg(not(feature = "tls"))]
pub(crate) fn build_connector(connect_timeout: Option<Duration>) -> Connector {
    build_http_connector(connect_timeout)
}

#[cfg(all(test, feature = "tls"))]
mod tests {
    use super::*;

    #[test]
    fn test_default_tls_config_has_roots() {
        let config = default_tls_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }
}
