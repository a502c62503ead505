//! Plumbing shared by the transport bindings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::SwarmError;
use crate::mcp::schema::{InboundFrame, RequestId, RpcResponse, METHOD_PING};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Shared HTTP client for the network bindings. No overall request timeout:
/// event streams stay open indefinitely and callers bound each request.
pub(super) fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default()
    })
}

type ResponseSender = oneshot::Sender<Result<RpcResponse, SwarmError>>;

/// In-flight requests awaiting a response, keyed by request id.
#[derive(Clone, Default)]
pub(super) struct PendingRequests {
    inner: Arc<Mutex<HashMap<RequestId, ResponseSender>>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, ResponseSender>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request before its frame is written.
    pub(super) fn register(&self, id: RequestId) -> Result<PendingResponse, SwarmError> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.lock();
        if map.contains_key(&id) {
            return Err(SwarmError::InvalidState(format!(
                "request id {id} is already in flight"
            )));
        }
        map.insert(id, tx);
        Ok(PendingResponse {
            id,
            pending: self.clone(),
            rx: Some(rx),
        })
    }

    /// Deliver a response to its waiter. Returns false for unknown ids.
    pub(super) fn resolve(&self, response: RpcResponse) -> bool {
        let Some(tx) = self.lock().remove(&response.id) else {
            return false;
        };
        tx.send(Ok(response)).is_ok()
    }

    /// Fail every waiter, e.g. when the channel to the peer is lost.
    pub(super) fn fail_all(&self, error: impl Fn() -> SwarmError) {
        let drained = std::mem::take(&mut *self.lock());
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
    }

    pub(super) fn len(&self) -> usize {
        self.lock().len()
    }

    fn forget(&self, id: RequestId) {
        self.lock().remove(&id);
    }
}

/// Handle for one in-flight request. Dropping it unregisters the id, so a
/// cancelled or timed-out caller leaves nothing behind.
pub(super) struct PendingResponse {
    id: RequestId,
    pending: PendingRequests,
    rx: Option<oneshot::Receiver<Result<RpcResponse, SwarmError>>>,
}

impl PendingResponse {
    pub(super) async fn wait(mut self) -> Result<RpcResponse, SwarmError> {
        let Some(rx) = self.rx.take() else {
            return Err(SwarmError::InvalidState("response already consumed".into()));
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SwarmError::Connection(format!(
                "channel closed before response {} arrived",
                self.id
            ))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so chunk boundaries
/// may fall anywhere, including inside a multi-byte character.
#[derive(Debug, Default)]
pub(super) struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                self.event = None;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        events
    }

    /// Whether an event was started but never terminated.
    pub(super) fn has_partial_event(&self) -> bool {
        !self.data.is_empty() || !self.buffer.is_empty()
    }
}

/// Convert configured headers into a reqwest header map.
pub(super) fn header_map(
    server: &str,
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, SwarmError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            SwarmError::Configuration(format!("server '{server}': invalid header '{name}': {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            SwarmError::Configuration(format!("server '{server}': invalid value for '{name}': {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Reply for a server-initiated request. Only `ping` is supported.
pub(super) fn reply_to_server_request(id: Value, method: &str) -> Value {
    if method == METHOD_PING {
        json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("method not supported: {method}")}
        })
    }
}

/// Pick the response to `id` out of a JSON body, if the body holds one.
pub(super) fn inline_response(body: &[u8], id: RequestId) -> Option<RpcResponse> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(text).ok()?;
    let frames = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    frames
        .into_iter()
        .filter_map(|frame| match InboundFrame::from_value(frame) {
            Ok(InboundFrame::Response(response)) if response.id == id => Some(response),
            _ => None,
        })
        .next()
}

/// Map a non-success HTTP status to an error.
pub(super) fn status_error(server: &str, status: StatusCode, body: &str) -> SwarmError {
    let body = body.trim();
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status.is_server_error()
        || matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        )
    {
        SwarmError::Connection(format!("server '{server}' answered {detail}"))
    } else {
        SwarmError::Transport(format!("server '{server}' answered {detail}"))
    }
}

pub(super) fn parse_url(server: &str, url: &str) -> Result<reqwest::Url, SwarmError> {
    reqwest::Url::parse(url).map_err(|e| {
        SwarmError::Configuration(format!("server '{server}': invalid url '{url}': {e}"))
    })
}
