//! Cluster coordination: roles, terms, and replication
//!
//! A cluster is a set of nodes, each running the same store, with
//! exactly one writable PRIMARY per election term. The primary fans
//! every durable mutation out to its peers as a REPLICATE message;
//! secondaries apply replicated mutations locally and reject direct
//! writes with a hint pointing at the primary.
//!
//! Failure detection is heartbeat-based: the primary broadcasts
//! HEARTBEAT once a second, and a node that has heard nothing for the
//! timeout window starts an election (see [`election`]). The protocol
//! elects a unique leader per term but does not carry a replicated log
//! index, so a new primary is not guaranteed to hold every write the
//! old one acknowledged; replication is best-effort by contract.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{info, warn};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::protocol::{Dispatch, Request, Response};
use crate::store::KvStore;

pub mod election;
pub mod peer;

/// Role a node currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Secondary,
    Candidate,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "PRIMARY"),
            NodeRole::Secondary => write!(f, "SECONDARY"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Protocol timers. The defaults are the production values; tests
/// shrink them to keep failover scenarios fast.
#[derive(Debug, Clone)]
pub struct ClusterTimings {
    /// How often a primary broadcasts HEARTBEAT.
    pub heartbeat_period: Duration,
    /// Silence longer than this makes a non-primary start an election.
    pub heartbeat_timeout: Duration,
    /// Election window bounds; the actual window is re-rolled uniformly
    /// from this range for every election to avoid lockstep candidates.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Budget for one peer RPC (connect + send + recv).
    pub rpc_timeout: Duration,
}

impl Default for ClusterTimings {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            election_timeout_min: Duration::from_secs(3),
            election_timeout_max: Duration::from_secs(6),
            rpc_timeout: peer::RPC_TIMEOUT,
        }
    }
}

/// Mutable coordination state, all guarded by one mutex.
pub(crate) struct ClusterState {
    pub role: NodeRole,
    /// Election epoch. Never decreases.
    pub term: u64,
    /// Candidate this node voted for in the current term.
    pub voted_for: Option<u64>,
    /// Last known primary address.
    pub primary: Option<(String, u16)>,
    /// When the last heartbeat arrived.
    pub last_heartbeat: Instant,
}

/// One node of the cluster: identity, peers, store, and coordination
/// state.
pub struct ClusterNode {
    node_id: u64,
    host: String,
    port: u16,
    peers: Vec<(String, u16)>,
    store: Arc<KvStore>,
    timings: ClusterTimings,
    state: Mutex<ClusterState>,
}

impl ClusterNode {
    pub fn new(
        node_id: u64,
        host: String,
        port: u16,
        peers: Vec<(String, u16)>,
        store: Arc<KvStore>,
        timings: ClusterTimings,
    ) -> Self {
        Self {
            node_id,
            host,
            port,
            peers,
            store,
            timings,
            state: Mutex::new(ClusterState {
                role: NodeRole::Secondary,
                term: 0,
                voted_for: None,
                primary: None,
                last_heartbeat: Instant::now(),
            }),
        }
    }

    /// Bootstrap shortcut: claim PRIMARY at term 0 so a cold cluster
    /// has a writable leader immediately instead of after the first
    /// heartbeat timeout.
    pub fn start_as_primary(&self) {
        let mut state = self.lock();
        state.role = NodeRole::Primary;
        state.primary = Some((self.host.clone(), self.port));
        state.last_heartbeat = Instant::now();
        info!("Node {} bootstrapped as PRIMARY", self.node_id);
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.lock().role
    }

    pub fn term(&self) -> u64 {
        self.lock().term
    }

    /// Last known primary address, if any.
    pub fn primary(&self) -> Option<(String, u16)> {
        self.lock().primary.clone()
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn timings(&self) -> &ClusterTimings {
        &self.timings
    }

    pub(crate) fn peers(&self) -> &[(String, u16)] {
        &self.peers
    }

    pub(crate) fn addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // Coordinator state never crosses an await while locked, so a
        // poisoned mutex can only mean a panic mid-update; propagating
        // the panic is the least-wrong option.
        self.state.lock().expect("cluster state lock poisoned")
    }

    /// HEARTBEAT from a primary: refresh the failure detector, and if
    /// the sender's term is current or newer, adopt it and follow.
    pub fn handle_heartbeat(&self, term: u64, primary_host: String, primary_port: u16) -> Response {
        let mut state = self.lock();
        state.last_heartbeat = Instant::now();
        if term >= state.term {
            if state.role != NodeRole::Secondary {
                info!(
                    "Node {} stepping down to SECONDARY (heartbeat term {} >= {})",
                    self.node_id, term, state.term
                );
            }
            state.term = term;
            state.primary = Some((primary_host, primary_port));
            state.role = NodeRole::Secondary;
        }
        Response::Ok
    }

    /// VOTE_REQUEST from a candidate. Grant at most one vote per term.
    pub fn handle_vote_request(&self, term: u64, candidate_id: u64) -> Response {
        let mut state = self.lock();

        if term > state.term {
            if state.role != NodeRole::Secondary {
                info!(
                    "Node {} stepping down to SECONDARY (vote request term {} > {})",
                    self.node_id, term, state.term
                );
                state.role = NodeRole::Secondary;
            }
            state.term = term;
            state.voted_for = None;
        }

        let granted = term == state.term
            && (state.voted_for.is_none() || state.voted_for == Some(candidate_id));
        if granted {
            state.voted_for = Some(candidate_id);
        }

        Response::Vote {
            granted,
            term: state.term,
        }
    }

    /// REPLICATE from the primary: apply the wrapped mutation locally,
    /// without re-replicating. Only secondaries apply; there is no
    /// per-operation term check (stale replicas converge on the next
    /// heartbeat cycle or diverge — best-effort contract).
    pub fn handle_replicate(&self, original: Request) -> Response {
        let is_secondary = self.lock().role == NodeRole::Secondary;
        if is_secondary && original.is_mutation() {
            let reply = self.store.execute(&original);
            if let Response::Error(e) = reply {
                warn!("Node {} failed to apply replicated operation: {}", self.node_id, e);
            }
        }
        Response::Ok
    }

    /// Fan a REPLICATE message out to every peer concurrently. Peer
    /// failures are logged and swallowed; the client's write already
    /// committed locally.
    async fn replicate(&self, original: &Request) -> Result<()> {
        let wrapped = serde_json::to_value(Request::Replicate {
            original_operation: Box::new(original.clone()),
        })?;

        let mut tasks = JoinSet::new();
        for peer_addr in &self.peers {
            let peer_addr = peer_addr.clone();
            let message = wrapped.clone();
            let timeout = self.timings.rpc_timeout;
            tasks.spawn(async move {
                let result = peer::call(&peer_addr, &message, timeout).await;
                (peer_addr, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok((peer_addr, Err(e))) = joined {
                warn!(
                    "Replication to {}:{} failed: {}",
                    peer_addr.0, peer_addr.1, e
                );
            }
        }
        Ok(())
    }

    /// Handle one decoded request: control plane to the coordinator,
    /// data plane to the store, mutations gated on being primary.
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Heartbeat {
                term,
                primary_host,
                primary_port,
            } => self.handle_heartbeat(term, primary_host, primary_port),
            Request::VoteRequest { term, candidate_id } => {
                self.handle_vote_request(term, candidate_id)
            }
            Request::Replicate { original_operation } => {
                self.handle_replicate(*original_operation)
            }
            request => {
                if request.is_mutation() {
                    {
                        let state = self.lock();
                        if state.role != NodeRole::Primary {
                            return Response::NotPrimary(state.primary.clone());
                        }
                    }

                    let reply = self.store.execute(&request);
                    if matches!(reply, Response::Success(_)) {
                        // Local commit is durable; now fan out. Waiting
                        // here keeps per-primary replication order for a
                        // client that serializes its own requests.
                        if let Err(e) = self.replicate(&request).await {
                            warn!("Replication fan-out failed: {}", e);
                        }
                    }
                    reply
                } else {
                    self.store.execute(&request)
                }
            }
        }
    }
}

impl Dispatch for ClusterNode {
    async fn dispatch(&self, request: Request) -> Response {
        self.handle_request(request).await
    }
}

/// Build the HEARTBEAT message a primary broadcasts.
pub(crate) fn heartbeat_message(term: u64, host: &str, port: u16) -> Value {
    serde_json::json!({
        "operation": "HEARTBEAT",
        "term": term,
        "primary_host": host,
        "primary_port": port,
    })
}

/// Strict-majority threshold for a cluster of `peers + 1` nodes: a
/// candidate wins with more than `(peers + 1) / 2` votes. With zero
/// peers the threshold is 0, so a lone node elects itself.
pub(crate) fn majority_threshold(peer_count: usize) -> usize {
    (peer_count + 1) / 2
}

/// Configuration for one cluster node.
#[derive(Clone)]
pub struct ClusterConfig {
    pub node_id: u64,
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port (the advertised primary
    /// address always reflects the port actually bound).
    pub port: u16,
    pub data_dir: PathBuf,
    /// Addresses of the *other* nodes.
    pub peers: Vec<(String, u16)>,
    /// Bootstrap this node as PRIMARY at term 0.
    pub start_as_primary: bool,
    pub timings: ClusterTimings,
}

/// A running cluster node: listener + coordinator + store.
pub struct ClusterServer {
    node: Arc<ClusterNode>,
    listener: TcpListener,
    stop: Arc<Notify>,
}

impl ClusterServer {
    /// Open the store (running crash recovery), bind the listener, and
    /// assemble the node.
    pub async fn new(config: ClusterConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();

        let store = Arc::new(KvStore::open(config.data_dir)?);
        let node = Arc::new(ClusterNode::new(
            config.node_id,
            config.host,
            port,
            config.peers,
            store,
            config.timings,
        ));
        if config.start_as_primary {
            node.start_as_primary();
        }

        Ok(Self {
            node,
            listener,
            stop: Arc::new(Notify::new()),
        })
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that makes `run` return, as if a shutdown signal arrived.
    pub fn stop_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.stop)
    }

    /// Serve until SIGINT/SIGTERM (or the stop handle fires), then
    /// checkpoint and return.
    pub async fn run(self) -> Result<()> {
        info!(
            "Node {} listening on {}",
            self.node.node_id(),
            self.listener.local_addr()?
        );

        let heartbeat_task = tokio::spawn(election::heartbeat_loop(Arc::clone(&self.node)));
        let checkpoint_task = tokio::spawn(crate::checkpoint_loop(
            Arc::clone(self.node.store()),
            crate::CHECKPOINT_INTERVAL,
        ));

        let shutdown = crate::shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }
                            let node = Arc::clone(&self.node);
                            tokio::spawn(async move {
                                let handler = crate::protocol::ConnectionHandler::new(stream, node);
                                if let Err(e) = handler.run().await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Node {} received shutdown signal", self.node.node_id());
                    break;
                }
                _ = self.stop.notified() => {
                    info!("Node {} stopping", self.node.node_id());
                    break;
                }
            }
        }

        heartbeat_task.abort();
        checkpoint_task.abort();
        drop(self.listener);
        self.node.store().shutdown()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_node(node_id: u64, peers: Vec<(String, u16)>) -> (ClusterNode, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().to_path_buf()).unwrap());
        let node = ClusterNode::new(
            node_id,
            "localhost".to_string(),
            10000 + node_id as u16,
            peers,
            store,
            ClusterTimings::default(),
        );
        (node, dir)
    }

    #[test]
    fn test_initial_role_is_secondary() {
        let (node, _dir) = test_node(1, Vec::new());
        assert_eq!(node.role(), NodeRole::Secondary);
        assert_eq!(node.term(), 0);
    }

    #[test]
    fn test_bootstrap_primary() {
        let (node, _dir) = test_node(1, Vec::new());
        node.start_as_primary();
        assert_eq!(node.role(), NodeRole::Primary);
        assert_eq!(node.term(), 0);
        assert_eq!(node.primary(), Some(("localhost".to_string(), 10001)));
    }

    #[test]
    fn test_heartbeat_adopts_newer_term() {
        let (node, _dir) = test_node(1, Vec::new());
        node.start_as_primary();

        let reply = node.handle_heartbeat(5, "otherhost".to_string(), 9000);
        assert_eq!(reply, Response::Ok);
        assert_eq!(node.role(), NodeRole::Secondary);
        assert_eq!(node.term(), 5);
        assert_eq!(node.primary(), Some(("otherhost".to_string(), 9000)));
    }

    #[test]
    fn test_stale_heartbeat_refreshes_timer_but_not_state() {
        let (node, _dir) = test_node(1, Vec::new());
        node.handle_vote_request(10, 2); // push term to 10
        assert_eq!(node.term(), 10);

        node.handle_heartbeat(3, "stale".to_string(), 1);
        assert_eq!(node.term(), 10);
        assert_eq!(node.primary(), None);
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let (node, _dir) = test_node(1, Vec::new());

        let first = node.handle_vote_request(1, 2);
        assert_eq!(first, Response::Vote { granted: true, term: 1 });

        // Same candidate may ask again.
        let again = node.handle_vote_request(1, 2);
        assert_eq!(again, Response::Vote { granted: true, term: 1 });

        // A different candidate in the same term is refused.
        let rival = node.handle_vote_request(1, 3);
        assert_eq!(rival, Response::Vote { granted: false, term: 1 });
    }

    #[test]
    fn test_vote_for_stale_term_is_refused() {
        let (node, _dir) = test_node(1, Vec::new());
        node.handle_vote_request(5, 2);

        let reply = node.handle_vote_request(3, 4);
        assert_eq!(reply, Response::Vote { granted: false, term: 5 });
    }

    #[test]
    fn test_newer_term_vote_clears_old_vote() {
        let (node, _dir) = test_node(1, Vec::new());
        node.handle_vote_request(1, 2);

        let reply = node.handle_vote_request(2, 3);
        assert_eq!(reply, Response::Vote { granted: true, term: 2 });
    }

    #[test]
    fn test_vote_request_with_newer_term_steps_primary_down() {
        let (node, _dir) = test_node(1, Vec::new());
        node.start_as_primary();

        node.handle_vote_request(1, 2);
        assert_eq!(node.role(), NodeRole::Secondary);
        assert_eq!(node.term(), 1);
    }

    #[test]
    fn test_term_never_decreases() {
        let (node, _dir) = test_node(1, Vec::new());
        node.handle_vote_request(7, 2);
        node.handle_heartbeat(3, "old".to_string(), 1);
        node.handle_vote_request(2, 3);
        assert_eq!(node.term(), 7);
    }

    #[tokio::test]
    async fn test_write_gating_on_secondary() {
        let (node, _dir) = test_node(1, Vec::new());
        node.handle_heartbeat(1, "leader".to_string(), 10001);

        let reply = node
            .handle_request(Request::Set { key: "k".into(), value: json!(1) })
            .await;
        assert_eq!(
            reply,
            Response::NotPrimary(Some(("leader".to_string(), 10001)))
        );

        // Reads are served by any role.
        let read = node.handle_request(Request::Get { key: "k".into() }).await;
        assert_eq!(read, Response::NotFound);
    }

    #[tokio::test]
    async fn test_write_gating_without_known_primary() {
        let (node, _dir) = test_node(1, Vec::new());
        let reply = node
            .handle_request(Request::Delete { key: "k".into() })
            .await;
        assert_eq!(reply, Response::NotPrimary(None));
    }

    #[tokio::test]
    async fn test_primary_accepts_writes() {
        let (node, _dir) = test_node(1, Vec::new());
        node.start_as_primary();

        let reply = node
            .handle_request(Request::Set { key: "k".into(), value: json!("v") })
            .await;
        assert_eq!(reply, Response::Success(true));

        let read = node.handle_request(Request::Get { key: "k".into() }).await;
        assert_eq!(read, Response::Value(json!("v")));
    }

    #[tokio::test]
    async fn test_replicate_applies_on_secondary() {
        let (node, _dir) = test_node(1, Vec::new());

        let reply = node.handle_replicate(Request::Set {
            key: "replicated".into(),
            value: json!(42),
        });
        assert_eq!(reply, Response::Ok);
        assert_eq!(node.store().get("replicated").unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_replicate_ignored_on_primary() {
        let (node, _dir) = test_node(1, Vec::new());
        node.start_as_primary();

        let reply = node.handle_replicate(Request::Set {
            key: "k".into(),
            value: json!(1),
        });
        assert_eq!(reply, Response::Ok);
        assert_eq!(node.store().get("k").unwrap(), None);
    }

    #[test]
    fn test_majority_threshold() {
        // 3-node cluster (2 peers): need > 1 vote, i.e. 2 of 3.
        assert_eq!(majority_threshold(2), 1);
        // 5-node cluster: need > 2, i.e. 3 of 5.
        assert_eq!(majority_threshold(4), 2);
        // Lone node: the self-vote beats a threshold of 0.
        assert_eq!(majority_threshold(0), 0);
    }

    #[test]
    fn test_heartbeat_message_shape() {
        let msg = heartbeat_message(3, "localhost", 10001);
        assert_eq!(msg["operation"], "HEARTBEAT");
        assert_eq!(msg["term"], 3);
        assert_eq!(msg["primary_host"], "localhost");
        assert_eq!(msg["primary_port"], 10001);
    }
}
