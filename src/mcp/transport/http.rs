//! Streamable HTTP binding: every request is its own POST whose response is
//! either a JSON body or a `text/event-stream` carrying the reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};

use super::common::{header_map, inline_response, parse_url, shared_client, status_error, SseDecoder};
use super::{ToolTransport, TransportKind};
use crate::error::SwarmError;
use crate::mcp::schema::{InboundFrame, RequestId, RpcNotification, RpcRequest, RpcResponse};

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Transport issuing one streaming POST per request.
pub struct StreamableHttpTransport {
    server: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    session: RwLock<Option<String>>,
    epoch: AtomicU64,
    open: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(
        server: impl Into<String>,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Self, SwarmError> {
        let server = server.into();
        Ok(Self {
            url: parse_url(&server, url)?,
            headers: header_map(&server, &headers)?,
            server,
            client: shared_client().clone(),
            session: RwLock::new(None),
            epoch: AtomicU64::new(0),
            open: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session(&self, session: Option<String>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn ensure_open(&self) -> Result<(), SwarmError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SwarmError::Connection(format!(
                "server '{}' is not connected",
                self.server
            )))
        }
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, SwarmError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SwarmError::Connection(format!("POST to '{}' failed: {e}", self.server)))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.set_session(Some(session.to_string()));
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            // The server forgot our session; a new initialize is required.
            self.set_session(None);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            tracing::info!(server = %self.server, "session expired");
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(&self.server, status, &body))
    }

    /// Read an event-stream response until the frame for `id` arrives.
    async fn read_stream(
        &self,
        response: reqwest::Response,
        id: RequestId,
    ) -> Result<RpcResponse, SwarmError> {
        let mut decoder = SseDecoder::default();
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk
                .map_err(|e| SwarmError::Transport(format!("event stream interrupted: {e}")))?;
            for event in decoder.push(&chunk) {
                match InboundFrame::parse(&event.data) {
                    Ok(InboundFrame::Response(response)) if response.id == id => {
                        return Ok(response);
                    }
                    Ok(other) => {
                        tracing::trace!(server = %self.server, frame = ?other, "skipping unrelated frame");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let detail = if decoder.has_partial_event() {
            "stream ended inside an incomplete event"
        } else {
            "stream ended without a response"
        };
        Err(SwarmError::Transport(format!(
            "{detail} for request {id} from '{}'",
            self.server
        )))
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

#[async_trait]
impl ToolTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    /// Connections are per request; this only arms the transport.
    async fn connect(&self) -> Result<(), SwarmError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, SwarmError> {
        self.ensure_open()?;
        let response = self.post(&request).await?;

        if is_event_stream(response.headers()) {
            return self.read_stream(response, request.id).await;
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SwarmError::Transport(format!("reading response body failed: {e}")))?;
        if let Some(response) = inline_response(&body, request.id) {
            return Ok(response);
        }
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Err(e) if e.is_eof() => Err(SwarmError::Transport(format!(
                "truncated response to request {} from '{}'",
                request.id, self.server
            ))),
            Err(e) => Err(SwarmError::Transport(format!(
                "malformed response from '{}': {e}",
                self.server
            ))),
            Ok(_) => Err(SwarmError::Transport(format!(
                "response from '{}' did not answer request {}",
                self.server, request.id
            ))),
        }
    }

    async fn notify(&self, notification: RpcNotification) -> Result<(), SwarmError> {
        self.ensure_open()?;
        self.post(&notification).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        self.set_session(None);

        // Best effort: the server may not support explicit termination.
        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server, error = %e, "session delete failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
