//! Scripted in-memory transport for client and registry tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ToolTransport, TransportKind};
use crate::error::SwarmError;
use crate::mcp::schema::{
    RpcNotification, RpcRequest, RpcResponse, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_LIST_TOOLS,
};

#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    pub close_calls: Arc<AtomicUsize>,
    pub methods: Arc<Mutex<Vec<String>>>,
    pub epoch: Arc<AtomicU64>,
}

impl MockHandle {
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Act as if the server dropped the session and a new one took over.
    pub fn replace_session(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

enum Scripted {
    Result(Value),
    RpcError(i64, String),
}

#[derive(Default)]
pub(crate) struct MockTransport {
    tools: Vec<Value>,
    calls: HashMap<String, Scripted>,
    instructions: Option<String>,
    fail_connect: bool,
    fail_initialize: bool,
    call_delay: Option<Duration>,
    page_size: Option<usize>,
    connected: AtomicBool,
    handle: MockHandle,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    pub fn with_tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        }));
        self
    }

    pub fn with_result(mut self, tool: &str, result: Value) -> Self {
        self.calls.insert(tool.into(), Scripted::Result(result));
        self
    }

    pub fn with_text_result(self, tool: &str, text: &str) -> Self {
        self.with_result(tool, json!({"content": [{"type": "text", "text": text}]}))
    }

    pub fn with_rpc_error(mut self, tool: &str, code: i64, message: &str) -> Self {
        self.calls
            .insert(tool.into(), Scripted::RpcError(code, message.into()));
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    fn list_page(&self, params: Option<&Value>) -> Value {
        let start = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(self.tools.len().max(1));
        let end = (start + size).min(self.tools.len());
        let mut page = json!({"tools": self.tools[start..end].to_vec()});
        if end < self.tools.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn connect(&self) -> Result<(), SwarmError> {
        if self.fail_connect {
            return Err(SwarmError::Connection("mock refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, SwarmError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SwarmError::Connection("mock not connected".into()));
        }
        self.handle
            .methods
            .lock()
            .unwrap()
            .push(request.method.clone());

        let id = request.id;
        match request.method.as_str() {
            METHOD_INITIALIZE if self.fail_initialize => {
                Ok(RpcResponse::failure(id, -32603, "initialize exploded"))
            }
            METHOD_INITIALIZE => {
                let mut result = json!({
                    "protocolVersion": crate::mcp::schema::PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1.0.0"}
                });
                if let Some(instructions) = &self.instructions {
                    result["instructions"] = json!(instructions);
                }
                Ok(RpcResponse::success(id, result))
            }
            METHOD_LIST_TOOLS => Ok(RpcResponse::success(id, self.list_page(request.params.as_ref()))),
            METHOD_CALL_TOOL => {
                if let Some(delay) = self.call_delay {
                    tokio::time::sleep(delay).await;
                }
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self.calls.get(name) {
                    Some(Scripted::Result(result)) => Ok(RpcResponse::success(id, result.clone())),
                    Some(Scripted::RpcError(code, message)) => {
                        Ok(RpcResponse::failure(id, *code, message.clone()))
                    }
                    None => {
                        let arguments = request
                            .params
                            .as_ref()
                            .and_then(|p| p.get("arguments"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        Ok(RpcResponse::success(
                            id,
                            json!({"content": [{"type": "text", "text": format!("{name}:{arguments}")}]}),
                        ))
                    }
                }
            }
            other => Ok(RpcResponse::failure(id, -32601, format!("unknown method {other}"))),
        }
    }

    async fn notify(&self, notification: RpcNotification) -> Result<(), SwarmError> {
        self.handle
            .methods
            .lock()
            .unwrap()
            .push(notification.method);
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        self.handle.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_epoch(&self) -> u64 {
        self.handle.epoch.load(Ordering::SeqCst)
    }
}
