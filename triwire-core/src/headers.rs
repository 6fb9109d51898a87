//! Case-insensitive multi-valued metadata map.
//!
//! Wraps [`http::HeaderMap`], which already provides case-insensitive
//! lookup and multi-valued entries, and adds the pieces the protocols
//! need: promotion of `trailer-`-prefixed headers and conversion to and
//! from the JSON metadata shape used by Connect end-stream frames.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Request, response, or trailer metadata for a single RPC.
///
/// Lookup, insertion, and removal are case-insensitive; iteration yields
/// keys in insertion order. Values that are not valid header names or
/// values are silently dropped on insert, matching how the wire treats
/// unrepresentable metadata.
#[derive(Clone, Debug, Default)]
pub struct Headers(HeaderMap);

impl Headers {
    pub fn new() -> Self {
        Self(HeaderMap::new())
    }

    /// Insert a value, replacing any existing values for the key.
    pub fn insert(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.0.insert(name, value);
        }
    }

    /// Append a value, keeping any existing values for the key.
    pub fn append(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.0.append(name, value);
        }
    }

    /// Get the first value for a key, if it is valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get all values for a key, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Remove all values for a key, returning the first removed value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0
            .remove(name)
            .and_then(|v| v.to_str().ok().map(str::to_owned))
    }

    pub fn len(&self) -> usize {
        self.0.keys_len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order. Keys with several
    /// values are yielded once per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
    }

    /// Merge all entries of `other` into `self`, appending values.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in other.0.iter() {
            self.0.append(name.clone(), value.clone());
        }
    }

    /// Remove every key starting with `prefix` and return the removed
    /// entries under the key with the prefix stripped.
    ///
    /// Connect unary responses deliver trailers as `trailer-`-prefixed
    /// headers; this is the promotion step.
    pub fn extract_prefixed(&mut self, prefix: &str) -> Headers {
        let prefixed: Vec<HeaderName> = self
            .0
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect();

        let mut extracted = Headers::new();
        for name in prefixed {
            let stripped = &name.as_str()[prefix.len()..];
            if let Ok(new_name) = HeaderName::try_from(stripped) {
                for value in self.0.get_all(&name) {
                    extracted.0.append(new_name.clone(), value.clone());
                }
            }
            self.0.remove(&name);
        }
        extracted
    }

    /// Build from the JSON metadata shape of a Connect end-stream frame:
    /// `{"key": ["value", ...], ...}`.
    pub fn from_json_map(map: HashMap<String, Vec<String>>) -> Self {
        let mut headers = Headers::new();
        for (key, values) in map {
            for value in values {
                headers.append(&key, &value);
            }
        }
        headers
    }

    pub fn as_header_map(&self) -> &HeaderMap {
        &self.0
    }
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        Self(map)
    }
}

impl FromIterator<(&'static str, &'static str)> for Headers {
    fn from_iter<I: IntoIterator<Item = (&'static str, &'static str)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("User-Agent", "my-custom-user-agent");

        assert_eq!(headers.get("user-agent"), Some("my-custom-user-agent"));
        assert_eq!(headers.get("USER-AGENT"), Some("my-custom-user-agent"));
        assert!(headers.contains_key("uSeR-aGeNt"));
    }

    #[test]
    fn test_multi_valued() {
        let mut headers = Headers::new();
        headers.append("x-custom", "one");
        headers.append("X-Custom", "two");

        assert_eq!(headers.get("x-custom"), Some("one"));
        assert_eq!(headers.get_all("x-custom"), vec!["one", "two"]);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_insert_replaces() {
        let mut headers = Headers::new();
        headers.append("x-custom", "one");
        headers.insert("x-custom", "two");
        assert_eq!(headers.get_all("x-custom"), vec!["two"]);
    }

    #[test]
    fn test_extract_prefixed_strips_prefix() {
        let mut headers = Headers::new();
        headers.insert("content-type", "application/json");
        headers.append("trailer-x-result", "partial");
        headers.append("trailer-x-result", "final");
        headers.insert("trailer-grpc-status", "0");

        let trailers = headers.extract_prefixed("trailer-");

        assert_eq!(trailers.get_all("x-result"), vec!["partial", "final"]);
        assert_eq!(trailers.get("grpc-status"), Some("0"));
        assert!(!headers.contains_key("trailer-x-result"));
        assert_eq!(headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn test_from_json_map() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), vec!["v".to_string()]);
        map.insert("multi".to_string(), vec!["a".to_string(), "b".to_string()]);

        let headers = Headers::from_json_map(map);
        assert_eq!(headers.get("k"), Some("v"));
        assert_eq!(headers.get_all("multi"), vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_entries_dropped() {
        let mut headers = Headers::new();
        headers.insert("bad header name", "value");
        headers.insert("x-ok", "bad\nvalue");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_merge_appends() {
        let mut a = Headers::new();
        a.insert("x-shared", "from-a");
        let mut b = Headers::new();
        b.insert("x-shared", "from-b");
        b.insert("x-only-b", "yes");

        a.merge(&b);
        assert_eq!(a.get_all("x-shared"), vec!["from-a", "from-b"]);
        assert_eq!(a.get("x-only-b"), Some("yes"));
    }
}
