//! MCP Client: JSON-RPC over stdio transport for tool servers.
//!
//! This module handles:
//! - Spawning and owning tool-server child processes
//! - JSON-RPC 2.0 request/response correlation over process stdio
//! - Draining server stderr into the log
//! - The initialize → ping → tools/list handshake and the tool catalog
//! - A generic invoke-by-name bridge for the LLM orchestrator
//! - Hosting several servers (start, restart with backoff, shutdown)

pub mod bridge;
pub mod catalog;
pub mod client;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod rpc;
pub mod session;
pub mod stderr;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use bridge::{ToolBridge, NO_RESULT};
pub use catalog::ToolCatalog;
pub use client::McpClient;
pub use config::{load_config, McpServersConfig, ServerConfig, SessionOptions, TimeoutConfig};
pub use errors::McpError;
pub use rpc::RpcSession;
pub use session::{McpSession, SessionState};
pub use types::{ClientInfo, ToolCallResult, ToolDescriptor};
