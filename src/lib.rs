//! minikv - a crash-durable, replicated key-value store
//!
//! Clients speak a length-prefixed JSON protocol over TCP: SET, GET,
//! DELETE, and atomic BULK_SET. Every acknowledged mutation is fsynced
//! to a write-ahead log before the reply goes out, so it survives an
//! abrupt kill; a periodic checkpoint bounds recovery time.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Clients                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Request Server                             │
//! │     (length-prefixed framing, one task per connection)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │    Cluster Coordinator   │ │          KvStore               │
//! │ (roles, election,        │ │  (map + WAL + checkpoint       │
//! │  replication)            │ │   under one lock)              │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                                        │
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     File System                             │
//! │                 (wal.log, data.pkl)                         │
//! └─────────────────────────────────────────────────────────────┘
//!
//! The standalone server in this module runs the store alone; the
//! [`cluster`] module wraps it with primary/secondary replication and
//! leader election for multi-node deployments.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;

pub mod client;
pub mod cluster;
pub mod error;
pub mod protocol;
pub mod store;

pub use client::KvClient;
pub use error::{KvError, Result};
pub use store::KvStore;

use protocol::{ConnectionHandler, Dispatch, Request, Response};

/// How often the background checkpoint fires.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Host to bind the server to
    pub host: String,
    /// Port to bind the server to
    pub port: u16,
    /// Directory for the WAL and checkpoint files
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9999,
            data_dir: PathBuf::from("./minikv_data"),
        }
    }
}

impl Dispatch for KvStore {
    async fn dispatch(&self, request: Request) -> Response {
        self.execute(&request)
    }
}

/// The standalone single-node server
pub struct Server {
    store: Arc<KvStore>,
    listener: TcpListener,
}

impl Server {
    /// Open the store (running crash recovery) and bind the listener.
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(KvStore::open(config.data_dir.clone())?);
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(Self { store, listener })
    }

    /// The address the server is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server until SIGINT/SIGTERM, then checkpoint and return.
    pub async fn run(self) -> Result<()> {
        info!("minikv server listening on {}", self.listener.local_addr()?);

        let checkpoint_task = tokio::spawn(checkpoint_loop(
            Arc::clone(&self.store),
            CHECKPOINT_INTERVAL,
        ));

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            // Small framed messages; Nagle only adds latency here.
                            if let Err(e) = stream.set_nodelay(true) {
                                error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let store = Arc::clone(&self.store);
                            tokio::spawn(async move {
                                let handler = ConnectionHandler::new(stream, store);
                                if let Err(e) = handler.run().await {
                                    error!("Connection error from {}: {}", addr, e);
                                }
                                info!("Connection closed: {}", addr);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        checkpoint_task.abort();
        drop(self.listener);
        self.store.shutdown()?;
        Ok(())
    }
}

/// Periodically checkpoint the store. Missed ticks coalesce rather
/// than bursting after a long stall.
pub async fn checkpoint_loop(store: Arc<KvStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // the first tick completes immediately

    loop {
        interval.tick().await;
        if let Err(e) = store.checkpoint() {
            error!("Periodic checkpoint failed: {}", e);
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
