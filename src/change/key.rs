//! Encoded Record Keys
//!
//! A composite primary key travels through the change log as alternating
//! column/value tokens joined by a configurable separator, e.g. `id|1` or
//! `id1|1|id2|2`. `RecordKey` is the decoded form: an ordered list of
//! column/value pairs (order matches the configured key column order).

use crate::error::{Error, Result};

/// Decoded primary key of one record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey(Vec<(String, String)>);

impl RecordKey {
    /// Build a key from ordered column/value pairs
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Build a single-column key
    pub fn single(column: &str, value: &str) -> Self {
        Self(vec![(column.to_string(), value.to_string())])
    }

    /// Decode an encoded key. Tolerates multi-character separators.
    pub fn decode(raw: &str, sep: &str) -> Result<Self> {
        let tokens: Vec<&str> = raw.split(sep).collect();
        if raw.is_empty() || tokens.len() < 2 || tokens.len() % 2 != 0 {
            return Err(Error::MalformedKey(raw.to_string()));
        }
        let pairs = tokens
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        Ok(Self(pairs))
    }

    /// Encode the key back into its change-log representation
    pub fn encode(&self, sep: &str) -> String {
        let tokens: Vec<&str> = self
            .0
            .iter()
            .flat_map(|(c, v)| [c.as_str(), v.as_str()])
            .collect();
        tokens.join(sep)
    }

    /// Short rendering for the event log: single-column keys log just the
    /// value, composite keys log the full encoded form
    pub fn brief(&self, sep: &str) -> String {
        if self.0.len() == 1 {
            self.0[0].1.clone()
        } else {
            self.encode(sep)
        }
    }

    /// Ordered column/value pairs
    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
