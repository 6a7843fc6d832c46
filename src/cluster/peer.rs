//! Peer RPC
//!
//! Node-to-node messages use the same framing as the client protocol:
//! one connection, one framed request, one framed reply. The whole
//! exchange (connect included) runs under a single short timeout so a
//! dead peer costs a bounded wait, never a hang.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;

use crate::error::{KvError, Result};
use crate::protocol::frame;

/// Default connect+send+recv budget for one peer exchange.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Send `message` to `peer` and wait for its reply.
pub async fn call(peer: &(String, u16), message: &Value, timeout: Duration) -> Result<Value> {
    let (host, port) = peer;
    let exchange = async {
        let mut stream = TcpStream::connect((host.as_str(), *port)).await?;
        stream.set_nodelay(true)?;
        frame::write_json(&mut stream, message).await?;
        match frame::read_json(&mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(KvError::Cluster(format!(
                "peer {}:{} closed the connection mid-exchange",
                host, port
            ))),
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(KvError::Timeout(format!("peer {}:{}", host, port))),
    }
}
