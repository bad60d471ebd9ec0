//! KV client implementation.

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {code}")]
    Server {
        code: String,
        primary_kv_port: Option<u16>,
    },

    #[error("no reachable primary")]
    NoPrimary,
}

impl ClientError {
    fn malformed(context: &str) -> Self {
        ClientError::Protocol(format!("malformed response: {}", context))
    }

    /// The `primary_kv_port` hint, when the server sent one.
    pub fn primary_hint(&self) -> Option<u16> {
        match self {
            ClientError::Server {
                primary_kv_port, ..
            } => *primary_kv_port,
            _ => None,
        }
    }

    pub fn is_not_primary(&self) -> bool {
        matches!(self, ClientError::Server { code, .. } if code == "not_primary")
    }
}

/// Connection to one KV node.
pub struct KvClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl KvClient {
    /// Connect to a KV server, e.g. `127.0.0.1:6380`.
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one request line and read the response line.
    async fn request(&mut self, body: Value) -> Result<Value, ClientError> {
        let mut line = serde_json::to_vec(&body)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;

        let mut response = String::new();
        let n = self.reader.read_line(&mut response).await?;
        if n == 0 {
            return Err(ClientError::Protocol("connection closed".to_string()));
        }

        let value: Value = serde_json::from_str(&response)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if value["ok"] == json!(true) {
            return Ok(value);
        }

        let code = value["error"]
            .as_str()
            .ok_or_else(|| ClientError::malformed("missing error code"))?
            .to_string();
        let primary_kv_port = value["hint"]["primary_kv_port"]
            .as_u64()
            .map(|p| p as u16);
        Err(ClientError::Server {
            code,
            primary_kv_port,
        })
    }

    /// Get a value. `None` means not found (or deleted).
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ClientError> {
        let response = self.request(json!({"op": "get", "key": key})).await?;
        if response["found"] == json!(false) {
            return Ok(None);
        }
        let value = response["value"]
            .as_str()
            .ok_or_else(|| ClientError::malformed("get without value"))?;
        Ok(Some(value.to_string()))
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), ClientError> {
        self.request(json!({"op": "set", "key": key, "value": value}))
            .await?;
        Ok(())
    }

    /// Set, asking the server to also attempt a snapshot with the debug
    /// fault injected.
    pub async fn set_simulating_snapshot_failure(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        self.request(json!({
            "op": "set",
            "key": key,
            "value": value,
            "debug_simulate_fail": true,
        }))
        .await?;
        Ok(())
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), ClientError> {
        self.request(json!({"op": "delete", "key": key})).await?;
        Ok(())
    }

    /// Atomically set several pairs: after a crash either all of them
    /// survive or none do.
    pub async fn bulk_set(&mut self, pairs: &[(&str, &str)]) -> Result<(), ClientError> {
        let pairs: Vec<Value> = pairs.iter().map(|(k, v)| json!([k, v])).collect();
        self.request(json!({"op": "bulkset", "pairs": pairs})).await?;
        Ok(())
    }

    /// Full-text search; returns matching keys.
    pub async fn search(&mut self, query: &str) -> Result<Vec<String>, ClientError> {
        let response = self.request(json!({"op": "search", "query": query})).await?;
        let keys = response["keys"]
            .as_array()
            .ok_or_else(|| ClientError::malformed("search without keys"))?;
        keys.iter()
            .map(|k| {
                k.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ClientError::malformed("non-string key"))
            })
            .collect()
    }

    /// Similarity search; returns `(key, score)` pairs, best first.
    pub async fn search_similar(
        &mut self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, ClientError> {
        let response = self
            .request(json!({"op": "search_similar", "query": query, "top_k": top_k}))
            .await?;
        let matches = response["matches"]
            .as_array()
            .ok_or_else(|| ClientError::malformed("search_similar without matches"))?;
        matches
            .iter()
            .map(|m| {
                let key = m["key"]
                    .as_str()
                    .ok_or_else(|| ClientError::malformed("match without key"))?;
                let score = m["score"]
                    .as_f64()
                    .ok_or_else(|| ClientError::malformed("match without score"))?;
                Ok((key.to_string(), score as f32))
            })
            .collect()
    }
}

/// Client for a primary/secondary cluster.
///
/// Holds the KV ports of all nodes. Writes are retried across the port
/// list, preferring the most recent `primary_kv_port` hint, until the
/// current primary accepts or the deadline passes. Reads go to whichever
/// node answers first.
pub struct ClusterClient {
    host: String,
    ports: Vec<u16>,
    last_primary: Option<u16>,
}

/// How long cluster operations keep retrying before giving up. Covers a
/// full election cycle with headroom.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(10);

const RETRY_PAUSE: Duration = Duration::from_millis(100);

impl ClusterClient {
    pub fn new(host: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            host: host.into(),
            ports,
            last_primary: None,
        }
    }

    fn candidate_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.ports.len());
        if let Some(primary) = self.last_primary {
            ports.push(primary);
        }
        for port in &self.ports {
            if Some(*port) != self.last_primary {
                ports.push(*port);
            }
        }
        ports
    }

    /// Set through the current primary, discovering it if needed.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), ClientError> {
        let started = std::time::Instant::now();
        loop {
            for port in self.candidate_ports() {
                let addr = format!("{}:{}", self.host, port);
                let mut client = match KvClient::connect(&addr).await {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                match client.set(key, value).await {
                    Ok(()) => {
                        self.last_primary = Some(port);
                        return Ok(());
                    }
                    Err(e) if e.is_not_primary() => {
                        if let Some(hinted) = e.primary_hint() {
                            self.last_primary = Some(hinted);
                        }
                    }
                    Err(ClientError::Connection(_)) | Err(ClientError::Protocol(_)) => {}
                    // `unavailable` is transient; keep retrying.
                    Err(ClientError::Server { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if started.elapsed() > DISCOVERY_DEADLINE {
                return Err(ClientError::NoPrimary);
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    /// Get from the first node that answers.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ClientError> {
        let started = std::time::Instant::now();
        loop {
            for port in self.candidate_ports() {
                let addr = format!("{}:{}", self.host, port);
                if let Ok(mut client) = KvClient::connect(&addr).await {
                    if let Ok(value) = client.get(key).await {
                        return Ok(value);
                    }
                }
            }
            if started.elapsed() > DISCOVERY_DEADLINE {
                return Err(ClientError::NoPrimary);
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }
}
