//! Agents and the hosted model service they run on.

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::error::SwarmError;
use crate::mcp::ToolServerRegistry;
use crate::types::{FileRef, Message, ToolCall};

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 16;

/// Prefix of the synthetic tool that delivers a message to another agent.
pub const SEND_MESSAGE_PREFIX: &str = "send_message_to_";

/// A named participant in the swarm.
#[derive(Clone, Builder)]
pub struct Agent {
    #[builder(into)]
    name: String,
    /// Shown to other agents in their `send_message_to_*` tool.
    #[builder(into)]
    description: Option<String>,
    #[builder(into)]
    instructions: Option<String>,
    /// Files attached to every turn this agent runs.
    #[builder(default)]
    files: Vec<FileRef>,
    tools: Option<Arc<ToolServerRegistry>>,
    #[builder(default = DEFAULT_MAX_TOOL_ROUNDS)]
    max_tool_rounds: usize,
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn files(&self) -> &[FileRef] {
        &self.files
    }

    pub fn tools(&self) -> Option<&Arc<ToolServerRegistry>> {
        self.tools.as_ref()
    }

    pub fn max_tool_rounds(&self) -> usize {
        self.max_tool_rounds
    }

    /// Display name of an attached file.
    pub fn file_name(&self, file_id: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|file| file.id == file_id)
            .map(|file| file.name.as_str())
    }

    /// Agent instructions followed by any notes the tool servers sent
    /// during their handshake.
    pub fn system_prompt(&self) -> Option<String> {
        let server_notes = self
            .tools
            .as_ref()
            .map(|registry| registry.instructions())
            .unwrap_or_default();

        let mut sections: Vec<String> = self.instructions.iter().cloned().collect();
        if !server_notes.is_empty() {
            let notes = server_notes
                .iter()
                .map(|(server, text)| format!("[{server}] {text}"))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Tool server notes:\n{notes}"));
        }
        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Everything the model service needs for one call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub agent: String,
    pub instructions: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub files: Vec<FileRef>,
}

/// A file the model cited directly in its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnotation {
    pub file_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    /// Character offset of the citation in the answer.
    pub index: u64,
}

/// A hit returned by the hosted file-search tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub file_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

/// One reply from the model service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub file_annotations: Vec<FileAnnotation>,
    #[serde(default)]
    pub search_hits: Vec<SearchHit>,
}

impl ModelResponse {
    /// A final answer.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        self.tool_calls.push(ToolCall::new(id, name, arguments));
        self
    }

    pub fn with_annotation(mut self, file_id: impl Into<String>, index: u64) -> Self {
        self.file_annotations.push(FileAnnotation {
            file_id: file_id.into(),
            filename: None,
            index,
        });
        self
    }

    pub fn with_search_hit(mut self, hit: SearchHit) -> Self {
        self.search_hits.push(hit);
        self
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// The hosted inference collaborator.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, SwarmError>;
}
