//! Stream identification key for upstream sharing.

use std::fmt;

use serde::Serialize;

/// A key identifying one logical upstream stream.
///
/// When multiple viewers request streams with equal keys they share the
/// same upstream pull. The key is opaque to the relay core; the proxy layer
/// builds it from the resolved upstream URL and the request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    /// Create a key from an arbitrary identity string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Create a key from an upstream URL and an optional query string.
    ///
    /// An empty query yields the bare URL, so `chA` requested with and
    /// without `?` maps to the same stream.
    pub fn from_parts(url: &str, query: Option<&str>) -> Self {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => Self(format!("{}?{}", url, q.trim_start_matches('?'))),
            None => Self(url.to_string()),
        }
    }

    /// Borrow the key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this key was built from `url`, with or without a query.
    pub fn has_base(&self, url: &str) -> bool {
        match self.0.strip_prefix(url) {
            Some(rest) => rest.is_empty() || rest.starts_with('?'),
            None => false,
        }
    }

    /// Returns true if the key is empty (not a valid stream identity).
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StreamKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_stream_key_equality() {
        let k1 = StreamKey::from_parts("http://up/chA.ts", Some("quality=hd"));
        let k2 = StreamKey::from_parts("http://up/chA.ts", Some("?quality=hd"));
        let k3 = StreamKey::from_parts("http://up/chA.ts", Some("quality=sd"));
        let k4 = StreamKey::from_parts("http://up/chA.ts", Some(""));

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k4, StreamKey::new("http://up/chA.ts"));
    }

    #[test]
    fn test_stream_key_in_hashmap() {
        let mut map = HashMap::new();
        let key = StreamKey::from("chA");
        map.insert(key.clone(), 42);

        assert_eq!(map.get(&key), Some(&42));
    }

    #[test]
    fn test_has_base() {
        let url = "http://up/chA.ts";
        assert!(StreamKey::new(url).has_base(url));
        assert!(StreamKey::from_parts(url, Some("quality=hd")).has_base(url));
        assert!(!StreamKey::new("http://up/chA.ts2").has_base(url));
        assert!(!StreamKey::new("http://up/chB.ts").has_base(url));
    }

    #[test]
    fn test_empty_key() {
        assert!(StreamKey::new("").is_empty());
        assert!(StreamKey::new("  ").is_empty());
        assert!(!StreamKey::new("chA").is_empty());
    }
}
