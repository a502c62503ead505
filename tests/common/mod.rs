//! Shared test helpers: a scripted model service and a mock tool server.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use swarmkit::agent::{ModelRequest, ModelResponse, ModelService};
use swarmkit::config::{SwarmConfig, ToolServerConfig, TransportConfig};
use swarmkit::error::SwarmError;

/// A model service that replays queued responses and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ModelResponse, SwarmError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn with_response(self, response: ModelResponse) -> Self {
        self.responses.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Queue a failure.
    pub fn with_failure(self, error: SwarmError) -> Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, SwarmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SwarmError::ModelService("script exhausted".into())))
    }
}

fn input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" }
        }
    })
}

fn tool_server_handler(
    server_name: &'static str,
    tools: &'static [(&'static str, &'static str)],
) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    move |request: &Request| {
        let body: Value = request.body_json().unwrap_or_else(|_| json!({}));
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": server_name, "version": "0.1.0" },
                "instructions": format!("{server_name} answers searches")
            }),
            "tools/list" => json!({
                "tools": tools
                    .iter()
                    .map(|(name, description)| json!({
                        "name": name,
                        "description": description,
                        "inputSchema": input_schema()
                    }))
                    .collect::<Vec<_>>()
            }),
            "tools/call" => {
                let tool = body["params"]["name"].as_str().unwrap_or_default();
                let arguments = body["params"]["arguments"].clone();
                if tool == "explode" {
                    json!({
                        "content": [{ "type": "text", "text": "boom" }],
                        "isError": true
                    })
                } else {
                    json!({
                        "content": [{
                            "type": "text",
                            "text": format!("{server_name}:{tool}:{arguments}")
                        }]
                    })
                }
            }
            "ping" => json!({}),
            other => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("unknown method {other}") }
                }));
            }
        };
        let response = ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result
        }));
        if body["params"]["name"] == "stall" {
            response.set_delay(Duration::from_secs(30))
        } else {
            response
        }
    }
}

/// A streamable-HTTP tool server answering every request inline.
pub async fn mock_tool_server(
    server_name: &'static str,
    tools: &'static [(&'static str, &'static str)],
) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(tool_server_handler(server_name, tools))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// A tool server that rejects everything with a 500.
pub async fn broken_tool_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("unavailable"))
        .mount(&server)
        .await;
    server
}

pub fn http_server_config(name: &str, server: &MockServer) -> ToolServerConfig {
    ToolServerConfig::new(name, TransportConfig::streamable_http(server.uri()))
}

pub fn swarm_config(servers: Vec<ToolServerConfig>) -> SwarmConfig {
    SwarmConfig {
        servers,
        ..SwarmConfig::default()
    }
}
