//! WAL record structures
//!
//! Every mutation the store acknowledges is first committed to the WAL
//! as one of these records. The encoding is self-describing JSON with a
//! `type` tag, so a record written by one process version replays in
//! another; values are restricted to the JSON value set.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single durable mutation entry.
///
/// `BulkSet` is deliberately one record for the whole batch: the record
/// is the unit of atomicity, so after a crash either the entire batch
/// replays or none of it does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecord {
    /// Bind `key` to `value`
    Set { key: String, value: Value },
    /// Remove `key`
    Delete { key: String },
    /// Bind every pair in `items`, atomically
    BulkSet { items: Vec<(String, Value)> },
}
