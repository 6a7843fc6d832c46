//! Framed request/response protocol
//!
//! Every message on the wire is a 4-byte big-endian length prefix
//! followed by a JSON object (see [`frame`]). A connection is a strict
//! request/reply loop: read one frame, dispatch, write one frame,
//! repeat until the peer hangs up.
//!
//! The module is backend-agnostic: the standalone server and the
//! cluster node both sit behind the [`Dispatch`] seam, so one
//! connection loop serves both binaries.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::error::KvError;

pub mod frame;
pub mod message;

pub use message::{BulkItem, Request, Response};

/// The seam between the wire loop and a request backend.
pub trait Dispatch: Send + Sync + 'static {
    /// Handle one decoded request and produce its reply.
    fn dispatch(&self, request: Request) -> impl Future<Output = Response> + Send;
}

/// Handles a single client connection.
pub struct ConnectionHandler<H: Dispatch> {
    stream: TcpStream,
    handler: Arc<H>,
}

impl<H: Dispatch> ConnectionHandler<H> {
    pub fn new(stream: TcpStream, handler: Arc<H>) -> Self {
        Self { stream, handler }
    }

    /// Run the request loop until the peer closes or an I/O error
    /// occurs. Framing errors (short reads, oversized frames) close
    /// silently; protocol errors inside an intact frame (bad JSON,
    /// unknown operation) are answered and the loop continues.
    pub async fn run(mut self) -> crate::error::Result<()> {
        loop {
            let payload = match frame::read_frame(&mut self.stream).await? {
                Some(payload) => payload,
                None => break,
            };

            let response = match serde_json::from_slice::<serde_json::Value>(&payload) {
                Ok(body) => match Request::from_value(body) {
                    Ok(request) => self.handler.dispatch(request).await,
                    Err(e) => Response::Error(e.to_string()),
                },
                Err(e) => Response::Error(KvError::from(e).to_string()),
            };

            frame::write_json(&mut self.stream, &response.to_value()).await?;
        }
        Ok(())
    }
}
