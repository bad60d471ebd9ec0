//! Three-node primary/secondary cluster tests: election, replication,
//! failover and the not-primary redirect.

use drift_kv_client::{ClusterClient, KvClient};
use drift_kv_server::bootstrap::{start_cluster_node_on, NodeHandle};
use drift_kv_server::cluster::primary::Role;
use drift_kv_server::cluster::{ClusterNodeConfig, PeerInfo};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Cluster {
    handles: Vec<NodeHandle>,
    kv_ports: Vec<u16>,
}

async fn spawn_cluster(dirs: &[TempDir]) -> Cluster {
    // Pre-bind every listener so each node knows its peers' real ports
    // before anything starts.
    let mut kv_listeners = Vec::new();
    let mut repl_listeners = Vec::new();
    for _ in 0..3 {
        kv_listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        repl_listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let kv_ports: Vec<u16> = kv_listeners
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    let repl_addrs: Vec<_> = repl_listeners
        .iter()
        .map(|l| l.local_addr().unwrap())
        .collect();

    let mut handles = Vec::new();
    for (i, (kv_listener, repl_listener)) in kv_listeners
        .into_iter()
        .zip(repl_listeners.into_iter())
        .enumerate()
    {
        let node_id = (i + 1) as u32;
        let peers = (0..3)
            .filter(|j| *j != i)
            .map(|j| PeerInfo {
                node_id: (j + 1) as u32,
                repl_addr: repl_addrs[j],
                kv_port: Some(kv_ports[j]),
            })
            .collect();
        let config = ClusterNodeConfig {
            node_id,
            kv_port: kv_ports[i],
            repl_port: repl_addrs[i].port(),
            data_dir: dirs[i].path().to_path_buf(),
            peers,
        };
        handles.push(
            start_cluster_node_on(config, kv_listener, repl_listener)
                .await
                .unwrap(),
        );
    }

    Cluster { handles, kv_ports }
}

/// Index of the unique primary, once exactly one node holds the role.
async fn wait_for_single_primary(handles: &[NodeHandle], deadline: Duration) -> usize {
    let started = Instant::now();
    loop {
        let primaries: Vec<usize> = handles
            .iter()
            .enumerate()
            .filter(|(_, h)| {
                h.controller
                    .as_ref()
                    .map(|c| c.role() == Role::Primary)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        if primaries.len() == 1 {
            return primaries[0];
        }
        assert!(
            started.elapsed() < deadline,
            "no unique primary within {:?} (saw {:?})",
            deadline,
            primaries
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_for_value(handles: &[NodeHandle], key: &str, expected: &str, deadline: Duration) {
    let started = Instant::now();
    loop {
        if handles
            .iter()
            .all(|h| h.engine.get(key).as_deref() == Some(expected))
        {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "nodes did not converge on {}={} within {:?}",
            key,
            expected,
            deadline
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_election_replication_and_failover() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster = spawn_cluster(&dirs).await;
    let mut handles = cluster.handles;

    // A primary emerges and accepts a write through multi-port discovery.
    let mut client = ClusterClient::new("127.0.0.1", cluster.kv_ports.clone());
    client.set("before", "failover").await.unwrap();

    let primary_idx = wait_for_single_primary(&handles, Duration::from_secs(10)).await;
    let old_term = handles[primary_idx].controller.as_ref().unwrap().term();

    // Heartbeat-driven gap-fill brings every node up to date, not just the
    // majority that acked.
    wait_for_value(&handles, "before", "failover", Duration::from_secs(5)).await;

    // Kill the primary outright.
    let primary = handles.remove(primary_idx);
    primary.abort();

    // A new primary takes over and the cluster accepts writes again.
    let started = Instant::now();
    client.set("after", "failover").await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "failover took {:?}",
        started.elapsed()
    );
    assert_eq!(
        client.get("after").await.unwrap(),
        Some("failover".to_string())
    );

    let new_primary_idx = wait_for_single_primary(&handles, Duration::from_secs(10)).await;
    let new_term = handles[new_primary_idx]
        .controller
        .as_ref()
        .unwrap()
        .term();
    assert!(new_term > old_term, "term must grow across elections");

    // Both survivors end up with the post-failover write.
    wait_for_value(&handles, "after", "failover", Duration::from_secs(5)).await;

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_secondary_rejects_writes_with_hint() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster = spawn_cluster(&dirs).await;
    let handles = cluster.handles;

    let primary_idx = wait_for_single_primary(&handles, Duration::from_secs(10)).await;
    let primary_port = handles[primary_idx].kv_addr.port();

    // Give heartbeats a moment to spread the primary's identity.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let secondary_idx = (0..3).find(|i| *i != primary_idx).unwrap();
    let mut secondary = KvClient::connect(&handles[secondary_idx].kv_addr.to_string())
        .await
        .unwrap();

    let err = secondary.set("k", "v").await.unwrap_err();
    assert!(err.is_not_primary(), "unexpected error: {:?}", err);
    assert_eq!(err.primary_hint(), Some(primary_port));

    // Reads are served by secondaries.
    let mut primary = KvClient::connect(&handles[primary_idx].kv_addr.to_string())
        .await
        .unwrap();
    primary.set("replicated", "yes").await.unwrap();
    let started = Instant::now();
    loop {
        if secondary.get("replicated").await.unwrap().as_deref() == Some("yes") {
            break;
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for handle in handles {
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_all_nodes_catch_up_under_load() {
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let cluster = spawn_cluster(&dirs).await;
    let handles = cluster.handles;

    let primary_idx = wait_for_single_primary(&handles, Duration::from_secs(10)).await;
    let mut client = KvClient::connect(&handles[primary_idx].kv_addr.to_string())
        .await
        .unwrap();

    for i in 0..20 {
        client.set(&format!("key{}", i), "value").await.unwrap();
    }

    // Every node catches up through appends and heartbeat gap-fill.
    let started = Instant::now();
    loop {
        if handles
            .iter()
            .all(|h| h.engine.get("key19").as_deref() == Some("value"))
        {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "secondaries did not catch up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for handle in handles {
        handle.shutdown().await;
    }
}
