//! Three-node leaderless mesh tests: local-durability acks, fan-out and
//! last-writer-wins convergence.

use drift_kv_client::KvClient;
use drift_kv_server::bootstrap::{start_leaderless_node_on, LeaderlessNodeConfig, NodeHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

async fn spawn_mesh(dirs: &[TempDir]) -> Vec<NodeHandle> {
    let mut kv_listeners = Vec::new();
    let mut repl_listeners = Vec::new();
    for _ in 0..3 {
        kv_listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        repl_listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let repl_addrs: Vec<SocketAddr> = repl_listeners
        .iter()
        .map(|l| l.local_addr().unwrap())
        .collect();

    let mut handles = Vec::new();
    for (i, (kv_listener, repl_listener)) in kv_listeners
        .into_iter()
        .zip(repl_listeners.into_iter())
        .enumerate()
    {
        let config = LeaderlessNodeConfig {
            node_id: (i + 1) as u32,
            kv_port: kv_listener.local_addr().unwrap().port(),
            repl_port: repl_addrs[i].port(),
            peer_repl_addrs: (0..3).filter(|j| *j != i).map(|j| repl_addrs[j]).collect(),
            data_dir: dirs[i].path().to_path_buf(),
        };
        handles.push(
            start_leaderless_node_on(config, kv_listener, repl_listener)
                .await
                .unwrap(),
        );
    }
    handles
}

async fn wait_for_agreement(handles: &[NodeHandle], key: &str, deadline: Duration) -> Option<String> {
    let started = Instant::now();
    loop {
        let values: Vec<Option<String>> = handles.iter().map(|h| h.engine.get(key)).collect();
        if values.windows(2).all(|w| w[0] == w[1]) {
            return values[0].clone();
        }
        assert!(
            started.elapsed() < deadline,
            "nodes disagree on {}: {:?}",
            key,
            values
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_every_node_accepts_writes() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let handles = spawn_mesh(&dirs).await;

    for (i, handle) in handles.iter().enumerate() {
        let mut client = KvClient::connect(&handle.kv_addr.to_string()).await.unwrap();
        client
            .set(&format!("from{}", i), &format!("node{}", i))
            .await
            .unwrap();
    }

    for i in 0..3 {
        let key = format!("from{}", i);
        let expected = format!("node{}", i);
        let agreed = wait_for_agreement(&handles, &key, Duration::from_secs(5)).await;
        assert_eq!(agreed, Some(expected));
    }

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_later_write_wins_everywhere() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let handles = spawn_mesh(&dirs).await;

    let mut client_a = KvClient::connect(&handles[0].kv_addr.to_string()).await.unwrap();
    let mut client_b = KvClient::connect(&handles[1].kv_addr.to_string()).await.unwrap();

    client_a.set("k", "A").await.unwrap();
    // Distinct wall-clock timestamps order the two writes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    client_b.set("k", "B").await.unwrap();

    let agreed = wait_for_agreement(&handles, "k", Duration::from_secs(5)).await;
    assert_eq!(agreed, Some("B".to_string()));

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_delete_propagates_as_tombstone() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let handles = spawn_mesh(&dirs).await;

    let mut client_a = KvClient::connect(&handles[0].kv_addr.to_string()).await.unwrap();
    let mut client_b = KvClient::connect(&handles[1].kv_addr.to_string()).await.unwrap();

    client_a.set("doomed", "value").await.unwrap();
    assert_eq!(
        wait_for_agreement(&handles, "doomed", Duration::from_secs(5)).await,
        Some("value".to_string())
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    client_b.delete("doomed").await.unwrap();
    assert_eq!(
        wait_for_agreement(&handles, "doomed", Duration::from_secs(5)).await,
        None
    );

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_concurrent_writes_converge_to_one_value() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let handles = spawn_mesh(&dirs).await;

    // Fire from all three nodes with no coordination; whatever carries the
    // greatest (timestamp, origin) must win on every node.
    for (i, handle) in handles.iter().enumerate() {
        let mut client = KvClient::connect(&handle.kv_addr.to_string()).await.unwrap();
        client.set("contended", &format!("writer{}", i)).await.unwrap();
    }

    let agreed = wait_for_agreement(&handles, "contended", Duration::from_secs(5)).await;
    assert!(agreed.is_some());

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_ack_does_not_wait_for_peers() {
    let dirs = [TempDir::new().unwrap()];

    // One node whose two peers do not exist.
    let kv_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let repl_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_repl_addrs = vec![dead_a.local_addr().unwrap(), dead_b.local_addr().unwrap()];
    drop(dead_a);
    drop(dead_b);

    let config = LeaderlessNodeConfig {
        node_id: 1,
        kv_port: kv_listener.local_addr().unwrap().port(),
        repl_port: repl_listener.local_addr().unwrap().port(),
        peer_repl_addrs,
        data_dir: dirs[0].path().to_path_buf(),
    };
    let handle = start_leaderless_node_on(config, kv_listener, repl_listener)
        .await
        .unwrap();

    let mut client = KvClient::connect(&handle.kv_addr.to_string()).await.unwrap();
    let started = Instant::now();
    client.set("k", "v").await.unwrap();
    // Local durability only; no replication deadline in the ack path.
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(client.get("k").await.unwrap(), Some("v".to_string()));

    handle.shutdown().await;
}
