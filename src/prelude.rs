//! Convenience re-exports for common use.

pub use crate::agent::{Agent, ModelRequest, ModelResponse, ModelService, ToolDefinition};
pub use crate::citation::{Citation, CitationKind};
pub use crate::config::{SwarmConfig, ToolServerConfig, TransportConfig};
pub use crate::error::{Result, SwarmError};
pub use crate::mcp::{CollisionPolicy, ToolServerClient, ToolServerRegistry};
pub use crate::orchestrator::{Orchestrator, TurnOutcome};
pub use crate::thread::{FileThreadPersistence, ThreadKey, ThreadPersistence, ThreadStore};
pub use crate::types::{FileRef, Message, Role, ToolCall};
