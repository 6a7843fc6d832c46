//! minikv - single-node server binary
//!
//! Serves SET/GET/DELETE/BULK_SET over the length-prefixed JSON
//! protocol, with WAL + checkpoint durability in `--data-dir`.

use std::path::PathBuf;

use log::info;

use minikv::{Config, Server};

fn print_usage() {
    println!("minikv - a crash-durable key-value store server");
    println!();
    println!("Usage: minikv [OPTIONS]");
    println!();
    println!("Options:");
    println!("      --host HOST       Host to bind to (default: localhost)");
    println!("  -p, --port PORT       Port to listen on (required)");
    println!("  -d, --data-dir DIR    Data directory (required)");
    println!("  -h, --help            Show this help");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();
    let mut port_set = false;
    let mut data_dir_set = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse()?;
                    port_set = true;
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    data_dir_set = true;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    if !port_set || !data_dir_set {
        print_usage();
        return Err("--port and --data-dir are required".into());
    }

    info!("Starting minikv server...");

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
