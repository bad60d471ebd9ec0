//! Integration tests for single-node operation: protocol walk, durability
//! across restarts and the debug snapshot fault.

use drift_kv_client::KvClient;
use drift_kv_server::bootstrap::{start_single, NodeHandle, SingleConfig};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn config(dir: &TempDir, enable_indexes: bool) -> SingleConfig {
    SingleConfig {
        port: 0,
        data_dir: dir.path().to_path_buf(),
        enable_indexes,
    }
}

async fn connect(handle: &NodeHandle) -> KvClient {
    KvClient::connect(&handle.kv_addr.to_string()).await.unwrap()
}

#[tokio::test]
async fn test_set_get_delete_roundtrip() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;

    client.set("hello", "world").await.unwrap();
    assert_eq!(client.get("hello").await.unwrap(), Some("world".to_string()));
    assert_eq!(client.get("missing").await.unwrap(), None);

    client.delete("hello").await.unwrap();
    assert_eq!(client.get("hello").await.unwrap(), None);

    // Empty values are legal.
    client.set("empty", "").await.unwrap();
    assert_eq!(client.get("empty").await.unwrap(), Some(String::new()));

    client
        .bulk_set(&[("a", "1"), ("b", "2"), ("c", "3")])
        .await
        .unwrap();
    assert_eq!(client.get("b").await.unwrap(), Some("2".to_string()));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_restart_preserves_acknowledged_writes() {
    let dir = TempDir::new().unwrap();

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    client.set("hello", "world").await.unwrap();
    client.set("k", "v1").await.unwrap();
    client.delete("k").await.unwrap();
    handle.shutdown().await;

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    assert_eq!(client.get("hello").await.unwrap(), Some("world".to_string()));
    assert_eq!(client.get("k").await.unwrap(), None);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_bulkset_survives_hard_kill() {
    let dir = TempDir::new().unwrap();

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    client
        .bulk_set(&[("a", "1"), ("b", "2"), ("c", "3")])
        .await
        .unwrap();
    // Acked, then the process dies without any graceful teardown.
    handle.abort();

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    assert_eq!(client.get("a").await.unwrap(), Some("1".to_string()));
    assert_eq!(client.get("b").await.unwrap(), Some("2".to_string()));
    assert_eq!(client.get("c").await.unwrap(), Some("3".to_string()));
    handle.shutdown().await;
}

#[tokio::test]
async fn test_simulated_snapshot_failure_recovers_from_wal() {
    let dir = TempDir::new().unwrap();

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    client
        .set_simulating_snapshot_failure("k", "survives")
        .await
        .unwrap();
    handle.abort();

    // Whether or not the snapshot persisted, the WAL has the entry.
    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    assert_eq!(client.get("k").await.unwrap(), Some("survives".to_string()));
    handle.shutdown().await;
}

#[tokio::test]
async fn test_search_requires_indexes() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;

    let err = client.search("anything").await.unwrap_err();
    match err {
        drift_kv_client::ClientError::Server { code, .. } => {
            assert_eq!(code, "indexes_disabled")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn test_search_and_similarity() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, true)).await.unwrap();
    let mut client = connect(&handle).await;

    client.set("doc1", "the quick brown fox").await.unwrap();
    client.set("doc2", "lazy dogs sleep all day").await.unwrap();
    client.set("doc3", "quick thinking").await.unwrap();

    assert_eq!(client.search("quick").await.unwrap(), vec!["doc1", "doc3"]);
    assert_eq!(
        client.search("quick fox").await.unwrap(),
        vec!["doc1".to_string()]
    );

    let matches = client.search_similar("quick brown foxes", 2).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].0, "doc1");

    // Deleted keys drop out of both indexes.
    client.delete("doc1").await.unwrap();
    assert_eq!(client.search("fox").await.unwrap(), Vec::<String>::new());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_indexes_rebuilt_after_restart() {
    let dir = TempDir::new().unwrap();

    let handle = start_single(config(&dir, true)).await.unwrap();
    let mut client = connect(&handle).await;
    client.set("doc1", "alpha beta gamma").await.unwrap();
    handle.shutdown().await;

    let handle = start_single(config(&dir, true)).await.unwrap();
    let mut client = connect(&handle).await;
    assert_eq!(client.search("beta").await.unwrap(), vec!["doc1"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_empty_key_is_a_protocol_error() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;

    let err = client.get("").await.unwrap_err();
    match err {
        drift_kv_client::ClientError::Server { code, .. } => assert_eq!(code, "protocol"),
        other => panic!("unexpected error: {:?}", other),
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn test_malformed_line_gets_protocol_error_then_close() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, false)).await.unwrap();

    let stream = TcpStream::connect(handle.kv_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"this is not json\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.contains(r#""error":"protocol""#));

    // The server closes the connection after a protocol error.
    line.clear();
    let n = reader.read_line(&mut line).await.unwrap();
    assert_eq!(n, 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let dir = TempDir::new().unwrap();
    let handle = start_single(config(&dir, false)).await.unwrap();

    let stream = TcpStream::connect(handle.kv_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let batch = concat!(
        r#"{"op":"set","key":"k","value":"first"}"#,
        "\n",
        r#"{"op":"get","key":"k"}"#,
        "\n",
        r#"{"op":"set","key":"k","value":"second"}"#,
        "\n",
        r#"{"op":"get","key":"k"}"#,
        "\n",
    );
    write_half.write_all(batch.as_bytes()).await.unwrap();

    let mut lines = Vec::new();
    for _ in 0..4 {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        lines.push(line);
    }

    assert!(lines[0].contains(r#""ok":true"#));
    assert!(lines[1].contains(r#""value":"first""#));
    assert!(lines[2].contains(r#""ok":true"#));
    assert!(lines[3].contains(r#""value":"second""#));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_is_fast_to_restart() {
    let dir = TempDir::new().unwrap();

    let handle = start_single(config(&dir, false)).await.unwrap();
    let mut client = connect(&handle).await;
    for i in 0..50 {
        client.set(&format!("key{}", i), "value").await.unwrap();
    }
    handle.shutdown().await;

    // The shutdown snapshot means a restart replays no WAL entries.
    let handle = start_single(config(&dir, false)).await.unwrap();
    assert_eq!(handle.engine.recovery_stats().wal_entries_replayed, 0);
    assert_eq!(handle.engine.len(), 50);
    handle.shutdown().await;
}
