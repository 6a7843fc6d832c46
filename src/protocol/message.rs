//! Request and response bodies
//!
//! Requests are JSON objects discriminated by their `operation` field.
//! Client operations (SET/GET/DELETE/BULK_SET) and the cluster control
//! plane (HEARTBEAT/VOTE_REQUEST/REPLICATE) share one enum because they
//! share one socket format; the dispatcher decides which half a node
//! actually serves.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{KvError, Result};

/// One `{key, value}` entry of a BULK_SET request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub key: String,
    pub value: Value,
}

/// A decoded request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum Request {
    #[serde(rename = "SET")]
    Set { key: String, value: Value },
    #[serde(rename = "GET")]
    Get { key: String },
    #[serde(rename = "DELETE")]
    Delete { key: String },
    #[serde(rename = "BULK_SET")]
    BulkSet { items: Vec<BulkItem> },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        term: u64,
        primary_host: String,
        primary_port: u16,
    },
    #[serde(rename = "VOTE_REQUEST")]
    VoteRequest { term: u64, candidate_id: u64 },
    #[serde(rename = "REPLICATE")]
    Replicate { original_operation: Box<Request> },
}

const KNOWN_OPERATIONS: &[&str] = &[
    "SET",
    "GET",
    "DELETE",
    "BULK_SET",
    "HEARTBEAT",
    "VOTE_REQUEST",
    "REPLICATE",
];

impl Request {
    /// Decode a request from its JSON body.
    ///
    /// An unrecognized (or missing) `operation` maps to the canonical
    /// "Unknown operation" error; a recognized operation with a
    /// malformed payload reports the shape problem.
    pub fn from_value(body: Value) -> Result<Request> {
        let known = body
            .get("operation")
            .and_then(Value::as_str)
            .map(|op| KNOWN_OPERATIONS.contains(&op))
            .unwrap_or(false);
        if !known {
            return Err(KvError::Protocol("Unknown operation".to_string()));
        }
        serde_json::from_value(body).map_err(|e| KvError::Protocol(e.to_string()))
    }

    /// True for SET/DELETE/BULK_SET (the operations a primary gates).
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::Set { .. } | Request::Delete { .. } | Request::BulkSet { .. }
        )
    }
}

/// A reply body, covering every shape the protocol produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `{"status": "OK"}` — control-plane acknowledgement
    Ok,
    /// `{"status": "OK", "success": bool}` — SET/DELETE/BULK_SET
    Success(bool),
    /// `{"status": "OK", "value": ...}` — GET hit
    Value(Value),
    /// `{"status": "NOT_FOUND", "value": null}` — GET miss
    NotFound,
    /// `{"status": "OK", "vote_granted": bool, "term": int}`
    Vote { granted: bool, term: u64 },
    /// `{"status": "ERROR", "message": ...}`
    Error(String),
    /// `{"status": "ERROR", "message": "Not primary", "primary": [h, p] | null}`
    NotPrimary(Option<(String, u16)>),
}

impl Response {
    pub fn to_value(&self) -> Value {
        match self {
            Response::Ok => json!({"status": "OK"}),
            Response::Success(success) => json!({"status": "OK", "success": success}),
            Response::Value(value) => json!({"status": "OK", "value": value}),
            Response::NotFound => json!({"status": "NOT_FOUND", "value": null}),
            Response::Vote { granted, term } => {
                json!({"status": "OK", "vote_granted": granted, "term": term})
            }
            Response::Error(message) => json!({"status": "ERROR", "message": message}),
            Response::NotPrimary(primary) => {
                let hint = match primary {
                    Some((host, port)) => json!([host, port]),
                    None => Value::Null,
                };
                json!({"status": "ERROR", "message": "Not primary", "primary": hint})
            }
        }
    }
}
