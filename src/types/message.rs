//! Message types stored in conversation threads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A message in a conversation thread.
///
/// Messages are value types; once appended to a thread the store only ever
/// hands out clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
    /// Agent that authored the message, when it was not the thread's sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: MessageMetadata::default(),
            name: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Create a user message with attached file identifiers.
    pub fn user_with_files(text: impl Into<String>, file_ids: Vec<String>) -> Self {
        let mut message = Self::new(Role::User, text);
        message.metadata.file_ids = file_ids;
        message
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::new(Role::Assistant, text);
        message.metadata.tool_calls = tool_calls;
        message
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.metadata.tool_call_id = Some(tool_call_id.into());
        message.metadata.is_error = is_error;
        message
    }

    /// Set the authoring agent.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Tool calls requested by this message.
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.metadata.tool_calls
    }

    pub fn is_error(&self) -> bool {
        self.metadata.is_error
    }
}

/// Conversation role.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Optional per-message metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Set on tool-role messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tools.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Files attached to the turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.tool_call_id.is_none()
            && self.tool_calls.is_empty()
            && self.file_ids.is_empty()
            && !self.is_error
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A provisioned file: the only two fields the core consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub id: String,
    pub name: String,
}

impl FileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_message_serializes_without_metadata() {
        let mut message = Message::user("hello");
        message.timestamp = None;
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn tool_result_carries_call_id_and_error_flag() {
        let message = Message::tool_result("call_1", "boom", true);
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.metadata.tool_call_id.as_deref(), Some("call_1"));
        assert!(message.is_error());

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["metadata"]["tool_call_id"], "call_1");
        assert_eq!(value["metadata"]["is_error"], true);
    }

    #[test]
    fn role_parses_from_lowercase() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::Tool.to_string(), "tool");
    }
}
