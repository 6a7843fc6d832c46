//! End-to-end tests over real TCP connections

use minikv::protocol::frame;
use minikv::{Config, KvClient, Server};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpStream;

/// Start a server on an ephemeral port; returns its port and data dir.
async fn start_server() -> (u16, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server_on(dir.path().to_path_buf()).await;
    (port, dir)
}

async fn start_server_on(data_dir: std::path::PathBuf) -> u16 {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir,
    };
    let server = Server::new(config).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());
    port
}

#[tokio::test]
async fn test_basic_round_trip() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    assert!(client.set("a", json!("1")).await.unwrap());
    assert_eq!(client.get("a").await.unwrap(), Some(json!("1")));
    assert!(client.delete("a").await.unwrap());
    assert_eq!(client.get("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_get_missing_is_not_found() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    let reply = client
        .request(json!({"operation": "GET", "key": "missing"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], "NOT_FOUND");
    assert_eq!(reply["value"], json!(null));
}

#[tokio::test]
async fn test_delete_missing_reports_failure() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();
    assert!(!client.delete("never-existed").await.unwrap());
}

#[tokio::test]
async fn test_bulk_set_round_trip() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    let items: Vec<(String, serde_json::Value)> = (0..5)
        .map(|i| (format!("bulk_{}", i), json!(i * 10)))
        .collect();
    assert!(client.bulk_set(&items).await.unwrap());

    for i in 0..5 {
        assert_eq!(
            client.get(&format!("bulk_{}", i)).await.unwrap(),
            Some(json!(i * 10))
        );
    }
}

#[tokio::test]
async fn test_empty_bulk_set_is_ok() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();
    assert!(client.bulk_set(&[]).await.unwrap());
}

#[tokio::test]
async fn test_deeply_nested_value() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    let value = json!([{"a": [{"b": [{"c": [1, null, true, "x"]}]}]}]);
    assert!(client.set("deep", value.clone()).await.unwrap());
    assert_eq!(client.get("deep").await.unwrap(), Some(value));
}

#[tokio::test]
async fn test_unknown_operation() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    let reply = client
        .request(json!({"operation": "COMPACT"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["message"], "Unknown operation");
}

#[tokio::test]
async fn test_cluster_message_rejected_on_standalone_node() {
    let (port, _dir) = start_server().await;
    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();

    let reply = client
        .request(json!({
            "operation": "HEARTBEAT",
            "term": 1,
            "primary_host": "localhost",
            "primary_port": 1
        }))
        .await
        .unwrap();
    assert_eq!(reply["status"], "ERROR");
    assert_eq!(reply["message"], "Unknown operation");
}

#[tokio::test]
async fn test_malformed_json_gets_error_reply() {
    let (port, _dir) = start_server().await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    frame::write_frame(&mut stream, b"{definitely not json").await.unwrap();
    let reply = frame::read_json(&mut stream).await.unwrap().unwrap();
    assert_eq!(reply["status"], "ERROR");

    // The connection stays usable afterwards.
    frame::write_json(&mut stream, &json!({"operation": "GET", "key": "k"}))
        .await
        .unwrap();
    let reply = frame::read_json(&mut stream).await.unwrap().unwrap();
    assert_eq!(reply["status"], "NOT_FOUND");
}

#[tokio::test]
async fn test_concurrent_clients() {
    let (port, _dir) = start_server().await;

    let mut handles = Vec::new();
    for c in 0..8 {
        handles.push(tokio::spawn(async move {
            let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();
            for i in 0..20 {
                let key = format!("client_{}_key_{}", c, i);
                assert!(client.set(&key, json!(i)).await.unwrap());
                assert_eq!(client.get(&key).await.unwrap(), Some(json!(i)));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();
    assert_eq!(
        client.get("client_7_key_19").await.unwrap(),
        Some(json!(19))
    );
}

#[tokio::test]
async fn test_values_survive_server_restart() {
    let dir = tempfile::tempdir().unwrap();

    let port = start_server_on(dir.path().to_path_buf()).await;
    {
        let mut client = KvClient::connect("127.0.0.1", port).await.unwrap();
        for i in 0..10 {
            assert!(client
                .set(&format!("persist:{}", i), json!(format!("value_{}", i)))
                .await
                .unwrap());
        }
    }
    // The first server keeps running on its own port; a second
    // instance over the same data dir plays the restarted process.
    // Every acknowledged write is in the WAL, so recovery sees it.
    let port2 = start_server_on(dir.path().to_path_buf()).await;
    let mut client = KvClient::connect("127.0.0.1", port2).await.unwrap();
    for i in 0..10 {
        assert_eq!(
            client.get(&format!("persist:{}", i)).await.unwrap(),
            Some(json!(format!("value_{}", i)))
        );
    }
}
