//! Tool dispatch for a turn: tool-server calls and agent delegation.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Orchestrator;
use crate::agent::{Agent, ToolDefinition, SEND_MESSAGE_PREFIX};
use crate::error::SwarmError;
use crate::thread::ThreadKey;
use crate::types::{Message, ToolCall};

impl Orchestrator {
    /// Tools offered to `agent`: its servers' catalog plus one
    /// `send_message_to_*` tool per outgoing flow.
    pub fn tool_definitions(&self, agent: &Agent) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = agent
            .tools()
            .map(|registry| {
                registry
                    .list_tools()
                    .into_iter()
                    .filter(|tool| {
                        let reserved = tool.exposed_name.starts_with(SEND_MESSAGE_PREFIX);
                        if reserved {
                            tracing::warn!(
                                agent = agent.name(),
                                tool = %tool.exposed_name,
                                server = %tool.server,
                                "tool name is reserved for agent messaging; hiding it"
                            );
                        }
                        !reserved
                    })
                    .map(|tool| ToolDefinition {
                        name: tool.exposed_name,
                        description: tool.description,
                        parameters: tool.input_schema,
                    })
                    .collect()
            })
            .unwrap_or_default();

        tools.extend(self.recipients_of(agent.name()).map(|recipient| {
            let description = match recipient.description() {
                Some(about) => format!("Send a message to {}. {about}", recipient.name()),
                None => format!("Send a message to {}.", recipient.name()),
            };
            ToolDefinition {
                name: format!("{SEND_MESSAGE_PREFIX}{}", recipient.name()),
                description,
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The message to deliver."
                        }
                    },
                    "required": ["message"]
                }),
            }
        }));
        tools
    }

    /// Run one tool call and turn its outcome into a tool-role message.
    /// Only cancellation escapes; every other failure is reported back to
    /// the model.
    pub(super) async fn tool_phase(
        &self,
        agent: &Agent,
        call: &ToolCall,
        cancel: &CancellationToken,
        chain: &[ThreadKey],
    ) -> Result<Message, SwarmError> {
        let outcome = match call.name.strip_prefix(SEND_MESSAGE_PREFIX) {
            Some(recipient) => self.delegate(agent, recipient, call, cancel, chain).await,
            None => self.invoke_tool(agent, call, cancel).await,
        };

        match outcome {
            Ok(text) => Ok(Message::tool_result(&call.id, text, false)),
            Err(e @ SwarmError::Cancelled(_)) => Err(e),
            Err(e) => {
                tracing::warn!(
                    agent = agent.name(),
                    tool = %call.name,
                    error = %e,
                    "tool call failed"
                );
                Ok(Message::tool_result(&call.id, format!("Error: {e}"), true))
            }
        }
    }

    async fn invoke_tool(
        &self,
        agent: &Agent,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, SwarmError> {
        let registry = agent
            .tools()
            .ok_or_else(|| SwarmError::ToolNotFound(call.name.clone()))?;
        let result = registry
            .invoke_with_cancel(&call.name, call.arguments.clone(), cancel)
            .await?;
        Ok(result.to_text())
    }

    async fn delegate(
        &self,
        agent: &Agent,
        recipient: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
        chain: &[ThreadKey],
    ) -> Result<String, SwarmError> {
        if !self.has_flow(agent.name(), recipient) {
            return Err(SwarmError::InvalidArgument(format!(
                "no communication flow from '{}' to '{recipient}'",
                agent.name()
            )));
        }
        let text = delegated_message(&call.arguments)?;
        tracing::debug!(sender = agent.name(), recipient, "delegating to agent");

        let outcome = self
            .run_turn(
                agent.name().to_string(),
                recipient.to_string(),
                Message::user(text).with_name(agent.name()),
                cancel,
                chain.to_vec(),
            )
            .await?;
        Ok(outcome.answer)
    }
}

/// The `message` argument of a delegation call. Models sometimes send the
/// arguments as an encoded JSON string.
fn delegated_message(arguments: &Value) -> Result<String, SwarmError> {
    let decoded;
    let arguments = match arguments {
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| json!({ "message": raw }));
            &decoded
        }
        other => other,
    };
    arguments
        .get("message")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            SwarmError::InvalidArgument("missing string argument 'message'".into())
        })
}
