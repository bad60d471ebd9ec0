//! Client wire protocol.
//!
//! One JSON object per line, newline terminated. Requests carry an `op`
//! tag; responses are a flat envelope with `ok` plus op-specific fields.
//! A request receives exactly one response, in arrival order on the
//! connection.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted line length.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty key not allowed")]
    EmptyKey,
}

/// Client requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        #[serde(default, skip_serializing_if = "is_false")]
        debug_simulate_fail: bool,
    },
    Delete {
        key: String,
    },
    Bulkset {
        pairs: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "is_false")]
        debug_simulate_fail: bool,
    },
    Search {
        query: String,
    },
    SearchSimilar {
        query: String,
        #[serde(default = "default_top_k")]
        top_k: usize,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn default_top_k() -> usize {
    10
}

impl Request {
    /// Keys are opaque but never empty.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let empty = match self {
            Request::Get { key } | Request::Delete { key } | Request::Set { key, .. } => {
                key.is_empty()
            }
            Request::Bulkset { pairs, .. } => pairs.iter().any(|(key, _)| key.is_empty()),
            Request::Search { .. } | Request::SearchSimilar { .. } => false,
        };
        if empty {
            Err(ProtocolError::EmptyKey)
        } else {
            Ok(())
        }
    }
}

/// Error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Protocol,
    NotPrimary,
    Unavailable,
    Io,
    IndexesDisabled,
}

/// Extra context attached to error responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_kv_port: Option<u16>,
}

/// One similarity search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub key: String,
    pub score: f32,
}

/// Response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<SearchMatch>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<Hint>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn with_value(value: String) -> Self {
        Self {
            ok: true,
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn not_found() -> Self {
        Self {
            ok: true,
            found: Some(false),
            ..Default::default()
        }
    }

    pub fn with_keys(keys: Vec<String>) -> Self {
        Self {
            ok: true,
            keys: Some(keys),
            ..Default::default()
        }
    }

    pub fn with_matches(matches: Vec<SearchMatch>) -> Self {
        Self {
            ok: true,
            matches: Some(matches),
            ..Default::default()
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            ok: false,
            error: Some(code),
            ..Default::default()
        }
    }

    pub fn not_primary(primary_kv_port: Option<u16>) -> Self {
        Self {
            ok: false,
            error: Some(ErrorCode::NotPrimary),
            hint: Some(Hint { primary_kv_port }),
            ..Default::default()
        }
    }
}

/// Read one request line. `Ok(None)` means the peer closed the connection
/// cleanly.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take((MAX_LINE_BYTES + 1) as u64);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong);
    }

    let request: Request = serde_json::from_slice(&line)?;
    request.validate()?;
    Ok(Some(request))
}

/// Write one response line.
pub async fn write_response<W>(writer: &mut W, response: &Response) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
