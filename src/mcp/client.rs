//! Client for one tool server: handshake, catalog and invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rmcp::model::{CallToolResult, Content, JsonObject, ResourceContents};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::schema::{
    RpcErrorObject, RpcNotification, RpcRequest, ToolSchema, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_LIST_TOOLS, PROTOCOL_VERSION,
};
use super::transport::{build_transport, ToolTransport};
use crate::config::{TimeoutConfig, ToolServerConfig};
use crate::error::SwarmError;
use crate::util::retry::RetryPolicy;
use crate::util::timeout::cancellable;

/// Upper bound on `tools/list` pages, against servers that loop cursors.
const MAX_CATALOG_PAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Initialized,
    Closed,
}

/// Identity a server reports during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub structured_content: Option<Value>,
    pub text_content: Option<String>,
    pub content: Vec<Value>,
}

impl ToolCallResult {
    pub fn into_value_or_text(self) -> Value {
        if let Some(structured) = self.structured_content {
            return structured;
        }
        if let Some(text) = self.text_content {
            return Value::String(text);
        }
        Value::Array(self.content)
    }

    /// Text handed back to the model as the tool-role message.
    pub fn to_text(&self) -> String {
        if let Some(text) = &self.text_content {
            return text.clone();
        }
        if let Some(structured) = &self.structured_content {
            return structured.to_string();
        }
        Value::Array(self.content.clone()).to_string()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeReply {
    protocol_version: String,
    #[serde(default)]
    server_info: Option<ServerInfo>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    tools: Vec<rmcp::model::Tool>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Client for a single tool server over any transport binding.
pub struct ToolServerClient {
    config: ToolServerConfig,
    transport: Box<dyn ToolTransport>,
    timeouts: TimeoutConfig,
    state: RwLock<ConnectionState>,
    catalog: RwLock<Vec<ToolSchema>>,
    instructions: RwLock<Option<String>>,
    server_info: RwLock<Option<ServerInfo>>,
    generation: AtomicU64,
    /// Transport session the current catalog was fetched in.
    session_epoch: AtomicU64,
    next_id: AtomicU64,
    lifecycle: Mutex<()>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ToolServerClient {
    pub fn new(
        config: ToolServerConfig,
        transport: Box<dyn ToolTransport>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            config,
            transport,
            timeouts,
            state: RwLock::new(ConnectionState::Disconnected),
            catalog: RwLock::new(Vec::new()),
            instructions: RwLock::new(None),
            server_info: RwLock::new(None),
            generation: AtomicU64::new(0),
            session_epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            lifecycle: Mutex::new(()),
        }
    }

    /// Build the client and its transport binding from configuration.
    pub fn from_config(
        config: ToolServerConfig,
        timeouts: &TimeoutConfig,
        reconnect: &RetryPolicy,
    ) -> Result<Self, SwarmError> {
        let transport = build_transport(&config, timeouts, reconnect)?;
        Ok(Self::new(config, transport, timeouts.clone()))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *read(&self.state)
    }

    pub fn is_initialized(&self) -> bool {
        self.connection_state() == ConnectionState::Initialized
    }

    /// Bumped every time a catalog is fetched; registries use it to spot
    /// entries from an earlier session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Usage instructions the server sent during the handshake.
    pub fn instructions(&self) -> Option<String> {
        read(&self.instructions).clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        read(&self.server_info).clone()
    }

    /// Connect, handshake and fetch the tool catalog.
    pub async fn start(&self) -> Result<(), SwarmError> {
        self.start_with_cancel(&CancellationToken::new()).await
    }

    pub async fn start_with_cancel(&self, cancel: &CancellationToken) -> Result<(), SwarmError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() && self.transport.is_connected() {
            return Ok(());
        }

        let result = cancellable(cancel, self.timeouts.connect, "start", self.handshake(cancel)).await;
        match result {
            Ok(tool_count) => {
                tracing::info!(
                    server = %self.config.name,
                    transport = %self.transport.kind(),
                    tools = tool_count,
                    "tool server ready"
                );
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = self.transport.close().await {
                    tracing::debug!(server = %self.config.name, error = %close_err, "close after failed start");
                }
                self.reset(ConnectionState::Disconnected);
                tracing::warn!(server = %self.config.name, error = %e, "tool server failed to start");
                Err(match e {
                    SwarmError::Cancelled(_) => e,
                    other => SwarmError::server_init(&self.config.name, other.to_string()),
                })
            }
        }
    }

    /// Whether the transport moved to a new server session since the
    /// catalog was fetched.
    pub fn session_reset(&self) -> bool {
        self.is_initialized()
            && self.transport.session_epoch() != self.session_epoch.load(Ordering::SeqCst)
    }

    /// Repeat the handshake and catalog fetch after a session reset.
    pub async fn resync(&self, cancel: &CancellationToken) -> Result<(), SwarmError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.session_reset() {
            return Ok(());
        }
        tracing::info!(server = %self.config.name, "server session replaced; repeating handshake");

        match cancellable(cancel, self.timeouts.connect, "resync", self.handshake(cancel)).await {
            Ok(tool_count) => {
                tracing::debug!(server = %self.config.name, tools = tool_count, "catalog refetched");
                Ok(())
            }
            Err(e) => {
                self.reset(ConnectionState::Disconnected);
                tracing::warn!(server = %self.config.name, error = %e, "handshake after session reset failed");
                Err(match e {
                    SwarmError::Cancelled(_) => e,
                    other => SwarmError::server_init(&self.config.name, other.to_string()),
                })
            }
        }
    }

    async fn handshake(&self, cancel: &CancellationToken) -> Result<usize, SwarmError> {
        self.transport.connect().await?;
        self.session_epoch
            .store(self.transport.session_epoch(), Ordering::SeqCst);
        *write(&self.state) = ConnectionState::Connected;

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "swarmkit", "version": env!("CARGO_PKG_VERSION")}
        });
        let reply = self
            .request(METHOD_INITIALIZE, Some(params), cancel)
            .await?
            .map_err(|e| SwarmError::Transport(format!("initialize rejected: {e}")))?;
        let reply: InitializeReply = serde_json::from_value(reply)
            .map_err(|e| SwarmError::Transport(format!("malformed initialize result: {e}")))?;
        tracing::debug!(
            server = %self.config.name,
            protocol = %reply.protocol_version,
            "handshake complete"
        );

        self.transport
            .notify(RpcNotification::new(METHOD_INITIALIZED, None))
            .await?;

        let tools = self.fetch_catalog(cancel).await?;
        let count = tools.len();
        *write(&self.server_info) = reply.server_info;
        *write(&self.instructions) = reply.instructions.filter(|s| !s.trim().is_empty());
        *write(&self.catalog) = tools;
        self.generation.fetch_add(1, Ordering::SeqCst);
        *write(&self.state) = ConnectionState::Initialized;
        Ok(count)
    }

    /// Follow `nextCursor` until the catalog is complete, keeping only
    /// allow-listed tools.
    async fn fetch_catalog(&self, cancel: &CancellationToken) -> Result<Vec<ToolSchema>, SwarmError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_CATALOG_PAGES {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let page = self
                .request(METHOD_LIST_TOOLS, params, cancel)
                .await?
                .map_err(|e| SwarmError::Transport(format!("tools/list rejected: {e}")))?;
            let page: ToolsPage = serde_json::from_value(page)
                .map_err(|e| SwarmError::Transport(format!("malformed tools/list result: {e}")))?;

            tools.extend(
                page.tools
                    .into_iter()
                    .map(map_tool_schema)
                    .filter(|tool| self.config.allows(&tool.name)),
            );
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
        Err(SwarmError::Transport(format!(
            "tools/list did not finish within {MAX_CATALOG_PAGES} pages"
        )))
    }

    /// Issue one request bounded by the request timeout.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Result<Value, RpcErrorObject>, SwarmError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id, method, params);
        let response = cancellable(
            cancel,
            self.timeouts.request,
            method,
            self.transport.send_request(request),
        )
        .await?;
        Ok(response.into_result())
    }

    /// The allow-listed tool catalog. Empty unless the client is started.
    pub fn list_tools(&self) -> Vec<ToolSchema> {
        if !self.is_initialized() {
            return Vec::new();
        }
        read(&self.catalog).clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.is_initialized() && read(&self.catalog).iter().any(|t| t.name == name)
    }

    /// Invoke a tool on the server.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolCallResult, SwarmError> {
        self.invoke_with_cancel(name, arguments, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, SwarmError> {
        if self.session_reset() {
            self.resync(cancel).await?;
        }
        if !self.has_tool(name) {
            return Err(SwarmError::ToolNotFound(name.to_string()));
        }
        let arguments = coerce_tool_arguments(arguments)?;
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = Value::Object(arguments);
        }

        tracing::debug!(server = %self.config.name, tool = %name, "calling tool");
        let result = self
            .request(METHOD_CALL_TOOL, Some(params), cancel)
            .await?
            .map_err(|e| SwarmError::tool_execution(name, e.to_string()))?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| SwarmError::Transport(format!("malformed tools/call result: {e}")))?;
        map_call_result(name, result)
    }

    /// Close the transport. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<(), SwarmError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.connection_state() == ConnectionState::Closed && !self.transport.is_connected() {
            return Ok(());
        }
        let result = self.transport.close().await;
        self.reset(ConnectionState::Closed);
        tracing::debug!(server = %self.config.name, "tool server stopped");
        result
    }

    fn reset(&self, state: ConnectionState) {
        write(&self.catalog).clear();
        *write(&self.instructions) = None;
        *write(&self.state) = state;
    }
}

fn map_tool_schema(tool: rmcp::model::Tool) -> ToolSchema {
    ToolSchema {
        name: tool.name.to_string(),
        description: tool.description.map(|d| d.to_string()),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

fn coerce_tool_arguments(value: Value) -> Result<Option<JsonObject>, SwarmError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed: Value = serde_json::from_str(trimmed).map_err(|e| {
                SwarmError::InvalidArgument(format!("tool arguments must be valid JSON: {e}"))
            })?;
            coerce_tool_arguments(parsed)
        }
        other => Err(SwarmError::InvalidArgument(format!(
            "tool arguments must be a JSON object; got {other}"
        ))),
    }
}

fn extract_text_content(content: &[Content]) -> Option<String> {
    let lines = content
        .iter()
        .filter_map(|item| {
            if let Some(text) = item.as_text() {
                return Some(text.text.clone());
            }
            match &item.as_resource()?.resource {
                ResourceContents::TextResourceContents { text, .. } => Some(text.clone()),
                _ => None,
            }
        })
        .collect::<Vec<_>>();

    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn map_call_result(name: &str, result: CallToolResult) -> Result<ToolCallResult, SwarmError> {
    let text_content = extract_text_content(&result.content);
    let content = result
        .content
        .iter()
        .filter_map(|item| serde_json::to_value(item).ok())
        .collect::<Vec<_>>();

    if result.is_error.unwrap_or(false) {
        let message = text_content
            .clone()
            .or_else(|| result.structured_content.as_ref().map(Value::to_string))
            .unwrap_or_else(|| "tool returned an error result".into());
        return Err(SwarmError::tool_execution(name, message));
    }

    Ok(ToolCallResult {
        structured_content: result.structured_content,
        text_content,
        content,
    })
}
