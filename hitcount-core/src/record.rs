// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The unit of work handed to a [`CountStore`](crate::CountStore).

use std::fmt;

/// An aggregated `(key, total)` pair on its way to storage.
///
/// A record is one already-aggregated batch. Stores should treat consecutive records for the same
/// key as separate batches, not as deltas against whatever they stored before.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlushRecord {
    key: String,
    total: i64,
}

impl FlushRecord {
    /// Create a record for `key` carrying `total`
    pub fn new(key: impl Into<String>, total: i64) -> Self {
        Self {
            key: key.into(),
            total,
        }
    }

    /// The key the total was aggregated under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The aggregated total
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Split the record into its key and total
    pub fn into_parts(self) -> (String, i64) {
        (self.key, self.total)
    }
}

impl fmt::Display for FlushRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.total)
    }
}

impl<K: Into<String>> From<(K, i64)> for FlushRecord {
    fn from((key, total): (K, i64)) -> Self {
        Self::new(key, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_assignment() {
        assert_eq!(FlushRecord::new("u1", 12).to_string(), "u1=12");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_object() {
        let json = serde_json::to_value(FlushRecord::new("page/home", -3)).unwrap();
        assert_eq!(json, serde_json::json!({"key": "page/home", "total": -3}));
    }
}
