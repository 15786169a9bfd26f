//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The tool-server process could not be started.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialize → ping → tools/list handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// The server's stdin/stdout is closed (process exited or was shut down).
    #[error("transport closed for server '{server}': {reason}")]
    TransportClosed {
        server: String,
        reason: String,
    },

    /// A response line was empty, malformed, or carried neither result nor error.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("remote error [{code}]: {message}")]
    RemoteError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the bounded wait.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// Tool not present in the discovered catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// The session is not in a state that allows the operation.
    #[error("session '{name}' is {state}")]
    InvalidState {
        name: String,
        state: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error makes tool mode unavailable for the server, as
    /// opposed to failing a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::InitFailed { .. }
                | McpError::RestartExhausted { .. }
                | McpError::ConfigError { .. }
        )
    }
}
