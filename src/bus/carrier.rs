//! Trace context carrier over message headers.
//!
//! A propagator writes `traceparent`/`tracestate`/`baggage` entries into a
//! carrier before publish and reads them back on consume. The carrier never
//! validates values; a missing or malformed header just yields a context
//! without a remote parent.

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector};

/// String-keyed header bag. Keys are case-sensitive as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCarrier {
    headers: BTreeMap<String, String>,
}

impl HeaderCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `key`, or an empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.headers.get(key).map(String::as_str).unwrap_or("")
    }

    /// Insert or overwrite `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Snapshot of the present keys.
    pub fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.headers
    }
}

impl From<BTreeMap<String, String>> for HeaderCarrier {
    fn from(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl FromIterator<(String, String)> for HeaderCarrier {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            headers: iter.into_iter().collect(),
        }
    }
}

impl Injector for HeaderCarrier {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_string(), value);
    }
}

impl Extractor for HeaderCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}
