//! Tool-server transport layer.
//!
//! Three bindings share one request/response contract: a spawned child
//! process speaking newline-delimited JSON, a persistent server-sent event
//! stream paired with POSTs, and per-request streaming HTTP.

mod common;
mod http;
mod sse;
mod stdio;

#[cfg(test)]
pub(crate) mod test_support;

use async_trait::async_trait;
use strum::Display;

use crate::config::{TimeoutConfig, ToolServerConfig, TransportConfig};
use crate::error::SwarmError;
use crate::util::retry::RetryPolicy;

use super::schema::{RpcNotification, RpcRequest, RpcResponse};

pub use http::StreamableHttpTransport;
pub use sse::EventStreamTransport;
pub use stdio::{ProcessTransport, ShutdownOutcome, ShutdownStage};

/// Which binding a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Process,
    EventStream,
    StreamableHttp,
}

/// Transport trait for tool-server communication.
///
/// Methods take `&self` so that requests from concurrent tool invocations
/// can be in flight at the same time; each binding correlates responses to
/// requests by id.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel. Calling it on a connected transport
    /// is a no-op; calling it after `close` reconnects.
    async fn connect(&self) -> Result<(), SwarmError>;

    /// Send a request and wait for the response carrying the same id.
    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, SwarmError>;

    /// Send a notification. No response is awaited.
    async fn notify(&self, notification: RpcNotification) -> Result<(), SwarmError>;

    /// Release every resource held by the transport. Idempotent.
    async fn close(&self) -> Result<(), SwarmError>;

    fn is_connected(&self) -> bool;

    /// Bumped whenever the peer session was replaced underneath the
    /// transport. Handshake state from an older value no longer holds.
    fn session_epoch(&self) -> u64 {
        0
    }
}

/// Build the transport binding selected by a server's configuration.
pub fn build_transport(
    server: &ToolServerConfig,
    timeouts: &TimeoutConfig,
    reconnect: &RetryPolicy,
) -> Result<Box<dyn ToolTransport>, SwarmError> {
    server.transport.validate(&server.name)?;
    let headers = server.transport.resolved_headers();

    Ok(match &server.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Box::new(
            ProcessTransport::new(&server.name, command, args.clone())
                .with_env(env.clone())
                .with_cwd(cwd.clone())
                .with_shutdown(timeouts.shutdown),
        ),
        TransportConfig::Sse { url, .. } => Box::new(
            EventStreamTransport::new(&server.name, url, headers)?
                .with_connect_timeout(timeouts.connect)
                .with_reconnect(reconnect.clone()),
        ),
        TransportConfig::StreamableHttp { url, .. } => {
            Box::new(StreamableHttpTransport::new(&server.name, url, headers)?)
        }
    })
}
