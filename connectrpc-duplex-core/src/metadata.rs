//! Header and trailer metadata.

use std::collections::BTreeMap;

use base64::Engine;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};

use crate::error::{ProtocolError, decode_base64};

/// Metadata wrapper around HTTP headers.
///
/// Used for request headers, response headers, trailers and error metadata.
/// Keys ending in `-bin` carry base64-encoded binary values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    headers: HeaderMap,
}

impl Metadata {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Get a header value by name.
    ///
    /// Returns `None` if the header is not present or cannot be converted to a string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Get all values for a header (for headers that appear multiple times).
    pub fn get_all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
    }

    /// Decode a binary (`-bin`) value.
    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).and_then(|v| decode_base64(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Insert a value, replacing any existing values for `key`.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), ProtocolError> {
        let (name, value) = header_pair(key, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Append a value, keeping existing values for `key`.
    pub fn append(&mut self, key: &str, value: &str) -> Result<(), ProtocolError> {
        let (name, value) = header_pair(key, value)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Insert a binary value under a `-bin` key.
    pub fn insert_bin(&mut self, key: &str, value: &[u8]) -> Result<(), ProtocolError> {
        if !key.ends_with("-bin") {
            return Err(ProtocolError::InvalidHeader(key.to_string()));
        }
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(value);
        self.insert(key, &encoded)
    }

    pub fn remove(&mut self, key: &str) {
        self.headers.remove(key);
    }

    /// Append every entry of `other` into `self`.
    pub fn extend(&mut self, other: &Metadata) {
        for (name, value) in other.headers.iter() {
            self.headers.append(name.clone(), value.clone());
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Build metadata from the JSON object used by Connect end-of-stream
    /// messages. Entries that are not valid headers are skipped.
    pub fn from_json_map(map: &BTreeMap<String, Vec<String>>) -> Self {
        let mut metadata = Metadata::default();
        for (key, values) in map {
            for value in values {
                let _ = metadata.append(key, value);
            }
        }
        metadata
    }

    /// Render as the JSON object used by Connect end-of-stream messages.
    pub fn to_json_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in self.headers.iter() {
            if let Ok(value) = value.to_str() {
                map.entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        map
    }

    /// Copy of `self` without protocol-reserved keys.
    pub fn without_reserved(&self) -> Metadata {
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers.iter() {
            if !is_reserved_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        Metadata { headers }
    }
}

fn header_pair(key: &str, value: &str) -> Result<(HeaderName, HeaderValue), ProtocolError> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| ProtocolError::InvalidHeader(key.to_string()))?;
    let value =
        HeaderValue::from_str(value).map_err(|_| ProtocolError::InvalidHeader(key.to_string()))?;
    Ok((name, value))
}

/// Headers owned by the protocol layer; application metadata may not set them.
pub fn is_reserved_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        "content-type"
            | "content-length"
            | "content-encoding"
            | "accept-encoding"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "connection"
            | "host"
            | "user-agent"
            | "x-grpc-web"
    ) || name.starts_with("grpc-")
        || name.starts_with("connect-")
}

impl From<HeaderMap> for Metadata {
    fn from(headers: HeaderMap) -> Self {
        Self::new(headers)
    }
}

impl From<Metadata> for HeaderMap {
    fn from(metadata: Metadata) -> Self {
        metadata.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_get_and_append() {
        let mut metadata = Metadata::empty();
        metadata.append("x-multi", "a").unwrap();
        metadata.append("x-multi", "b").unwrap();

        assert_eq!(metadata.get("x-multi"), Some("a"));
        assert_eq!(metadata.get_all("x-multi").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(metadata.insert("bad header", "v").is_err());
    }

    #[test]
    fn test_binary_values() {
        let mut metadata = Metadata::empty();
        metadata.insert_bin("x-trace-bin", &[0, 1, 2, 255]).unwrap();
        assert_eq!(metadata.get("x-trace-bin"), Some("AAEC/w"));
        assert_eq!(metadata.get_bin("x-trace-bin"), Some(vec![0, 1, 2, 255]));
        assert!(metadata.insert_bin("x-trace", &[1]).is_err());
    }

    #[test]
    fn test_json_map_conversion() {
        let mut metadata = Metadata::empty();
        metadata.append("x-count", "1").unwrap();
        metadata.append("x-count", "2").unwrap();

        let map = metadata.to_json_map();
        assert_eq!(map["x-count"], vec!["1".to_string(), "2".to_string()]);
        assert_eq!(Metadata::from_json_map(&map), metadata);
    }

    #[test]
    fn test_reserved_headers() {
        assert!(is_reserved_header("Content-Type"));
        assert!(is_reserved_header("grpc-timeout"));
        assert!(is_reserved_header("connect-protocol-version"));
        assert!(!is_reserved_header("x-request-id"));

        let mut metadata = Metadata::empty();
        metadata.insert("grpc-status", "0").unwrap();
        metadata.insert("x-keep", "yes").unwrap();
        let cleaned = metadata.without_reserved();
        assert!(!cleaned.contains("grpc-status"));
        assert!(cleaned.contains("x-keep"));
    }
}
