//! Heartbeat and election loop
//!
//! One background task per node drives the whole failure-detection
//! protocol: a primary broadcasts HEARTBEAT every period; everyone else
//! watches the clock and calls an election when the primary has been
//! silent past the timeout.
//!
//! Elections follow the familiar shape: bump the term, vote for
//! yourself, ask every peer, and claim PRIMARY on a strict majority of
//! the full cluster. The window a candidate waits for votes is rolled
//! uniformly from a range so two candidates that time out together do
//! not stay in lockstep forever.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use super::{heartbeat_message, majority_threshold, peer, ClusterNode, ClusterTimings, NodeRole};

/// Drive heartbeats and elections forever. Spawned once per node.
pub async fn heartbeat_loop(node: Arc<ClusterNode>) {
    let mut interval = tokio::time::interval(node.timings().heartbeat_period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let (role, stale) = {
            let state = node.lock();
            (
                state.role,
                state.last_heartbeat.elapsed() > node.timings().heartbeat_timeout,
            )
        };

        match role {
            NodeRole::Primary => send_heartbeats(&node).await,
            _ if stale => start_election(&node).await,
            _ => {}
        }
    }
}

/// Broadcast HEARTBEAT to every peer, concurrently, best effort.
async fn send_heartbeats(node: &ClusterNode) {
    let (host, port) = node.addr();
    let message = heartbeat_message(node.term(), &host, port);

    let mut tasks = JoinSet::new();
    for peer_addr in node.peers() {
        let peer_addr = peer_addr.clone();
        let message = message.clone();
        let timeout = node.timings().rpc_timeout;
        tasks.spawn(async move {
            let result = peer::call(&peer_addr, &message, timeout).await;
            (peer_addr, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Ok(((host, port), Err(e))) = joined {
            debug!("Heartbeat to {}:{} failed: {}", host, port, e);
        }
    }
}

/// Pick this election's vote-collection window.
fn roll_election_window(timings: &ClusterTimings) -> Duration {
    let min = timings.election_timeout_min;
    let max = timings.election_timeout_max;
    if max <= min {
        return min;
    }
    let span = (max - min).as_secs_f64();
    min + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..span))
}

/// Run one election round.
///
/// The candidate only counts votes whose reply echoes its own term, and
/// only installs the outcome if it is still the candidate of that term
/// when counting ends (a newer primary or candidate may have interposed
/// while votes were in flight).
pub async fn start_election(node: &ClusterNode) {
    let (term, window) = {
        let mut state = node.lock();
        state.role = NodeRole::Candidate;
        state.term += 1;
        state.voted_for = Some(node.node_id());
        (state.term, roll_election_window(node.timings()))
    };
    info!("Node {} starting election for term {}", node.node_id(), term);

    let request = json!({
        "operation": "VOTE_REQUEST",
        "term": term,
        "candidate_id": node.node_id(),
    });

    let mut votes: usize = 1; // self-vote
    let mut tasks = JoinSet::new();
    for peer_addr in node.peers() {
        let peer_addr = peer_addr.clone();
        let message = request.clone();
        let timeout = node.timings().rpc_timeout;
        tasks.spawn(async move { peer::call(&peer_addr, &message, timeout).await });
    }

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(Ok(reply))) => {
                    let granted = reply["vote_granted"].as_bool().unwrap_or(false);
                    if granted && reply["term"].as_u64() == Some(term) {
                        votes += 1;
                    }
                }
                Some(_) => {} // unreachable peer or cancelled task
            }
        }
    }

    let won = votes > majority_threshold(node.peers().len());
    let mut state = node.lock();
    if state.role != NodeRole::Candidate || state.term != term {
        return;
    }
    if won {
        state.role = NodeRole::Primary;
        state.primary = Some(node.addr());
        info!(
            "Node {} became PRIMARY for term {} ({} votes)",
            node.node_id(),
            term,
            votes
        );
    } else {
        state.role = NodeRole::Secondary;
        info!(
            "Node {} lost the election for term {} ({} votes)",
            node.node_id(),
            term,
            votes
        );
    }
}
