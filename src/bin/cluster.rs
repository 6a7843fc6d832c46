//! minikv-cluster - replicated cluster node binary
//!
//! Runs one node of a primary/secondary cluster. Exactly one node
//! should be started with `--primary` so the cluster has a writable
//! leader immediately; without it the nodes elect one after the first
//! heartbeat timeout.

use std::path::PathBuf;

use log::info;

use minikv::cluster::{ClusterConfig, ClusterServer, ClusterTimings};

fn print_usage() {
    println!("minikv-cluster - a replicated key-value store node");
    println!();
    println!("Usage: minikv-cluster [OPTIONS]");
    println!();
    println!("Options:");
    println!("      --node-id ID      Numeric node id (required)");
    println!("      --host HOST       Host to bind to (default: localhost)");
    println!("  -p, --port PORT       Port to listen on (required)");
    println!("  -d, --data-dir DIR    Data directory (required)");
    println!("      --peers LIST      Comma-separated host:port of the other nodes");
    println!("      --primary         Bootstrap this node as PRIMARY (term 0)");
    println!("  -h, --help            Show this help");
}

fn parse_peers(list: &str) -> Result<Vec<(String, u16)>, Box<dyn std::error::Error>> {
    let mut peers = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (host, port) = part
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid peer address '{}'", part))?;
        peers.push((host.to_string(), port.parse()?));
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut node_id: Option<u64> = None;
    let mut host = "localhost".to_string();
    let mut port: Option<u16> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut peers: Vec<(String, u16)> = Vec::new();
    let mut start_as_primary = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--node-id" => {
                if i + 1 < args.len() {
                    node_id = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    data_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--peers" => {
                if i + 1 < args.len() {
                    peers = parse_peers(&args[i + 1])?;
                    i += 1;
                }
            }
            "--primary" => {
                start_as_primary = true;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let (node_id, port, data_dir) = match (node_id, port, data_dir) {
        (Some(n), Some(p), Some(d)) => (n, p, d),
        _ => {
            print_usage();
            return Err("--node-id, --port and --data-dir are required".into());
        }
    };

    info!("Starting minikv cluster node {}...", node_id);

    let server = ClusterServer::new(ClusterConfig {
        node_id,
        host,
        port,
        data_dir,
        peers,
        start_as_primary,
        timings: ClusterTimings::default(),
    })
    .await?;
    server.run().await?;

    Ok(())
}
