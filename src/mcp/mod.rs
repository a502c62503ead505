//! Tool-server layer: wire frames, transports, per-server clients and the
//! multi-server registry.

pub mod client;
pub mod registry;
pub mod schema;
pub mod transport;

pub use client::{ConnectionState, ServerInfo, ToolCallResult, ToolServerClient};
pub use registry::{CollisionPolicy, RegisteredTool, ServerStatus, StartReport, ToolServerRegistry};
pub use schema::ToolSchema;
pub use transport::{build_transport, ToolTransport, TransportKind};
