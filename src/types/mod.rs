//! Shared data types.

pub mod message;

pub use message::{FileRef, Message, MessageMetadata, Role, ToolCall};
