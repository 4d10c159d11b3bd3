//! `key=value` trace document returned by the edge.

use std::collections::BTreeMap;

use serde::Serialize;

/// Fields parsed from a trace body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceFields(BTreeMap<String, String>);

impl TraceFields {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Outbound address as seen by the edge.
    pub fn ip(&self) -> Option<&str> {
        self.get("ip")
    }

    /// Data-center location code.
    pub fn colo(&self) -> Option<&str> {
        self.get("colo")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for TraceFields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parse a trace body. Each line is split on its first `=`; key and value
/// are trimmed, and lines without `=` or with an empty key or value are
/// skipped. A repeated key keeps its last value.
pub fn extract_fields(body: &str) -> TraceFields {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
