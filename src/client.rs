//! Client for a minikv server
//!
//! Speaks the same length-prefixed JSON protocol as the server. One
//! client owns one connection; requests are issued one at a time.

use serde_json::{json, Value};
use tokio::net::TcpStream;

use crate::error::{KvError, Result};
use crate::protocol::frame;

/// A connected client.
pub struct KvClient {
    stream: TcpStream,
}

impl KvClient {
    /// Connect to a node.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Send a raw request body and return the raw reply.
    ///
    /// The typed accessors below cover the common operations; this is
    /// the escape hatch for control messages and tests.
    pub async fn request(&mut self, body: Value) -> Result<Value> {
        frame::write_json(&mut self.stream, &body).await?;
        match frame::read_json(&mut self.stream).await? {
            Some(reply) => Ok(reply),
            None => Err(KvError::Protocol(
                "connection closed by server".to_string(),
            )),
        }
    }

    /// Set a key. `Ok(true)` once the server has durably committed.
    pub async fn set(&mut self, key: &str, value: Value) -> Result<bool> {
        let reply = self
            .request(json!({"operation": "SET", "key": key, "value": value}))
            .await?;
        Ok(reply["status"] == "OK" && reply["success"].as_bool().unwrap_or(false))
    }

    /// Get a key. `Ok(None)` when the key is absent.
    pub async fn get(&mut self, key: &str) -> Result<Option<Value>> {
        let reply = self
            .request(json!({"operation": "GET", "key": key}))
            .await?;
        if reply["status"] == "NOT_FOUND" {
            return Ok(None);
        }
        if reply["status"] != "OK" {
            return Err(KvError::Protocol(
                reply["message"].as_str().unwrap_or("request failed").to_string(),
            ));
        }
        Ok(Some(reply["value"].clone()))
    }

    /// Delete a key. `Ok(false)` when the key was absent.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let reply = self
            .request(json!({"operation": "DELETE", "key": key}))
            .await?;
        Ok(reply["status"] == "OK" && reply["success"].as_bool().unwrap_or(false))
    }

    /// Atomically set every pair in `items`.
    pub async fn bulk_set(&mut self, items: &[(String, Value)]) -> Result<bool> {
        let wire_items: Vec<Value> = items
            .iter()
            .map(|(k, v)| json!({"key": k, "value": v}))
            .collect();
        let reply = self
            .request(json!({"operation": "BULK_SET", "items": wire_items}))
            .await?;
        Ok(reply["status"] == "OK" && reply["success"].as_bool().unwrap_or(false))
    }
}
