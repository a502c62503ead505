//! Event-stream binding: a long-lived `text/event-stream` GET announces a
//! POST endpoint; requests are POSTed there and responses arrive as
//! `message` events on the stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Url;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::common::{
    header_map, inline_response, parse_url, reply_to_server_request, shared_client, status_error,
    PendingRequests,
};
use super::{ToolTransport, TransportKind};
use crate::error::SwarmError;
use crate::mcp::schema::{InboundFrame, RpcNotification, RpcRequest, RpcResponse};
use crate::util::retry::RetryPolicy;
use crate::util::timeout::with_timeout;

const ENDPOINT_EVENT: &str = "endpoint";

#[derive(Debug, Clone, PartialEq)]
enum StreamState {
    Idle,
    Connecting,
    Ready(Url),
    Failed(String),
    Closed,
}

/// Transport over a persistent server-sent event stream.
pub struct EventStreamTransport {
    server: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    connect_timeout: Duration,
    reconnect: RetryPolicy,
    pending: PendingRequests,
    state_tx: Arc<watch::Sender<StreamState>>,
    state_rx: watch::Receiver<StreamState>,
    epoch: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventStreamTransport {
    pub fn new(
        server: impl Into<String>,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Self, SwarmError> {
        let server = server.into();
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let state_tx = Arc::new(state_tx);
        Ok(Self {
            url: parse_url(&server, url)?,
            headers: header_map(&server, &headers)?,
            server,
            client: shared_client().clone(),
            connect_timeout: Duration::from_secs(30),
            reconnect: RetryPolicy::default(),
            pending: PendingRequests::default(),
            state_tx,
            state_rx,
            epoch: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Wait until the stream has an endpoint or has definitively failed.
    async fn endpoint(&self) -> Result<Url, SwarmError> {
        let mut rx = self.state_rx.clone();
        let settled = with_timeout(self.connect_timeout, async move {
            rx.wait_for(|state| !matches!(state, StreamState::Connecting))
                .await
                .map(|state| state.clone())
                .map_err(|_| SwarmError::Connection("event stream task stopped".into()))
        })
        .await?;

        match settled {
            StreamState::Ready(url) => Ok(url),
            StreamState::Failed(message) => Err(SwarmError::Connection(message)),
            StreamState::Idle => Err(SwarmError::Connection(format!(
                "server '{}' is not connected",
                self.server
            ))),
            StreamState::Closed => Err(SwarmError::Connection("transport closed".into())),
            StreamState::Connecting => Err(SwarmError::InvalidState(
                "event stream still connecting".into(),
            )),
        }
    }

    async fn stop_task(&self, next: StreamState) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.state_tx.send_replace(next);
        self.pending
            .fail_all(|| SwarmError::Connection("transport closed".into()));
    }
}

#[async_trait]
impl ToolTransport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn connect(&self) -> Result<(), SwarmError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut task = self.task.lock().await;
            let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
            if running && matches!(*self.state_rx.borrow(), StreamState::Ready(_)) {
                return Ok(());
            }
            if let Some(stale) = task.take() {
                stale.abort();
            }
            self.state_tx.send_replace(StreamState::Connecting);
            *task = Some(tokio::spawn(run_stream(StreamContext {
                server: self.server.clone(),
                url: self.url.clone(),
                headers: self.headers.clone(),
                client: self.client.clone(),
                reconnect: self.reconnect.clone(),
                pending: self.pending.clone(),
                state: self.state_tx.clone(),
                epoch: self.epoch.clone(),
                first_endpoint: Some(first_tx),
            })));
        }

        let state = self.state_rx.clone();
        let first = with_timeout(self.connect_timeout, async move {
            first_rx.await.map_err(|_| {
                let message = match &*state.borrow() {
                    StreamState::Failed(message) => message.clone(),
                    _ => "event stream stopped before announcing an endpoint".to_string(),
                };
                SwarmError::Connection(message)
            })
        })
        .await;

        match first {
            Ok(endpoint) => {
                tracing::debug!(server = %self.server, endpoint = %endpoint, "event stream ready");
                Ok(())
            }
            Err(e) => {
                self.stop_task(StreamState::Idle).await;
                Err(match e {
                    SwarmError::Timeout(ms) => SwarmError::Connection(format!(
                        "server '{}' announced no endpoint within {ms}ms",
                        self.server
                    )),
                    other => other,
                })
            }
        }
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, SwarmError> {
        let endpoint = self.endpoint().await?;
        let waiter = self.pending.register(request.id)?;

        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| SwarmError::Connection(format!("POST to '{}' failed: {e}", self.server)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.server, status, &body));
        }

        // Some servers answer in the POST body instead of on the stream.
        let body = response
            .bytes()
            .await
            .map_err(|e| SwarmError::Transport(format!("reading POST response failed: {e}")))?;
        if let Some(inline) = inline_response(&body, request.id) {
            return Ok(inline);
        }
        waiter.wait().await
    }

    async fn notify(&self, notification: RpcNotification) -> Result<(), SwarmError> {
        let endpoint = self.endpoint().await?;
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(&notification)
            .send()
            .await
            .map_err(|e| SwarmError::Connection(format!("POST to '{}' failed: {e}", self.server)))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(&self.server, status, &body))
        }
    }

    async fn close(&self) -> Result<(), SwarmError> {
        self.stop_task(StreamState::Closed).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_rx.borrow(), StreamState::Ready(_))
    }

    fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

struct StreamContext {
    server: String,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
    reconnect: RetryPolicy,
    pending: PendingRequests,
    state: Arc<watch::Sender<StreamState>>,
    epoch: Arc<AtomicU64>,
    first_endpoint: Option<oneshot::Sender<Url>>,
}

impl StreamContext {
    fn fail(&self, message: String) {
        tracing::warn!(server = %self.server, "{message}");
        self.pending
            .fail_all(|| SwarmError::Connection(message.clone()));
        self.state.send_replace(StreamState::Failed(message));
    }

    async fn route(&self, data: &str) {
        match InboundFrame::parse(data) {
            Ok(InboundFrame::Response(response)) => {
                let id = response.id;
                if !self.pending.resolve(response) {
                    tracing::debug!(server = %self.server, id, "dropping response with no waiter");
                }
            }
            Ok(InboundFrame::Request { id, method, .. }) => self.answer(id, &method).await,
            Ok(InboundFrame::Notification { method, .. }) => {
                tracing::trace!(server = %self.server, method = %method, "server notification");
            }
            Err(e) => tracing::warn!(server = %self.server, error = %e, "ignoring malformed event"),
        }
    }

    async fn answer(&self, id: serde_json::Value, method: &str) {
        let endpoint = match &*self.state.borrow() {
            StreamState::Ready(url) => url.clone(),
            _ => return,
        };
        let result = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(&reply_to_server_request(id, method))
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server, error = %e, "failed to answer server request");
        }
    }
}

/// Own the event stream; reconnect with backoff after it drops.
///
/// A stream that never announced an endpoint fails immediately. Once one
/// has been announced, drops are retried until the policy is exhausted; the
/// attempt counter resets whenever a new endpoint arrives.
async fn run_stream(mut ctx: StreamContext) {
    let mut attempt: u32 = 0;
    let mut ever_ready = false;

    loop {
        let request = ctx
            .client
            .get(ctx.url.clone())
            .headers(ctx.headers.clone())
            .header(ACCEPT, "text/event-stream");
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                ctx.fail(format!("cannot open event stream: {e}"));
                return;
            }
        };

        let reason = loop {
            match source.next().await {
                Some(Ok(Event::Open)) => {
                    tracing::debug!(server = %ctx.server, "event stream opened");
                }
                Some(Ok(Event::Message(message))) if message.event == ENDPOINT_EVENT => {
                    match ctx.url.join(message.data.trim()) {
                        Ok(endpoint) => {
                            attempt = 0;
                            if ever_ready {
                                // A new endpoint is a new server session.
                                let epoch = ctx.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                                tracing::info!(server = %ctx.server, epoch, "event stream session replaced");
                            }
                            ever_ready = true;
                            if let Some(first) = ctx.first_endpoint.take() {
                                let _ = first.send(endpoint.clone());
                            }
                            ctx.state.send_replace(StreamState::Ready(endpoint));
                        }
                        Err(e) => tracing::warn!(
                            server = %ctx.server,
                            error = %e,
                            "ignoring unparseable endpoint"
                        ),
                    }
                }
                Some(Ok(Event::Message(message))) => ctx.route(&message.data).await,
                Some(Err(e)) => break e.to_string(),
                None => break "event stream ended".to_string(),
            }
        };
        source.close();

        if !ever_ready {
            ctx.fail(format!(
                "event stream for '{}' failed before announcing an endpoint: {reason}",
                ctx.server
            ));
            return;
        }

        ctx.pending
            .fail_all(|| SwarmError::Connection(format!("event stream lost: {reason}")));
        attempt += 1;
        if !ctx.reconnect.allows(attempt) {
            ctx.fail(format!(
                "event stream for '{}' lost after {} reconnect attempts: {reason}",
                ctx.server,
                attempt - 1
            ));
            return;
        }

        ctx.state.send_replace(StreamState::Connecting);
        let delay = ctx.reconnect.backoff(attempt);
        tracing::warn!(
            server = %ctx.server,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "event stream dropped ({reason}); reconnecting"
        );
        tokio::time::sleep(delay).await;
    }
}
