//! Error types for swarmkit.

use thiserror::Error;

/// Primary error type for all swarmkit operations.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport could not reach (or lost) its peer.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame, truncated stream or protocol violation.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool server '{server}' failed to start: {message}")]
    ServerInit { server: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' is exposed by several servers: {}", servers.join(", "))]
    AmbiguousTool { tool: String, servers: Vec<String> },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Unknown thread: {0}")]
    UnknownThread(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Model service error: {0}")]
    ModelService(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Transport,
    Configuration,
    Tool,
    Thread,
    Cancellation,
    Timeout,
    Model,
    Serialization,
    Unknown,
}

impl SwarmError {
    pub fn server_init(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServerInit {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_) => ErrorCategory::Connection,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Configuration(_) | Self::ServerInit { .. } => ErrorCategory::Configuration,
            Self::ToolNotFound(_) | Self::AmbiguousTool { .. } | Self::ToolExecution { .. } => {
                ErrorCategory::Tool
            }
            Self::UnknownThread(_) => ErrorCategory::Thread,
            Self::Cancelled(_) => ErrorCategory::Cancellation,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::ModelService(_) => ErrorCategory::Model,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::InvalidArgument(_) | Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout
        )
    }

    /// Errors that abort the current turn instead of being handed back to the
    /// model as a tool-role message.
    pub fn is_fatal_for_turn(&self) -> bool {
        matches!(
            self,
            Self::ModelService(_) | Self::UnknownThread(_) | Self::Cancelled(_)
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SwarmError>;
