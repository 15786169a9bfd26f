//! MCP Client: hosts one session per configured tool server.
//!
//! Orchestrators that talk to several servers (a ticket server, a semantic
//! search server, …) use this to start them together, obtain a `ToolBridge`
//! per server and restart a server that died.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::bridge::ToolBridge;
use super::config::{McpServersConfig, ServerConfig, SessionOptions};
use super::errors::McpError;
use super::lifecycle;
use super::session::McpSession;

/// High-level client that manages multiple tool-server sessions.
pub struct McpClient {
    /// Running sessions.
    sessions: HashMap<String, McpSession>,
    /// Server configurations (for restarts).
    configs: HashMap<String, ServerConfig>,
    /// Restarts performed per server.
    restart_counts: HashMap<String, u32>,
    options: SessionOptions,
}

impl McpClient {
    /// Create a client from a servers configuration.
    pub fn new(config: McpServersConfig, working_dir: Option<String>) -> Self {
        let mut options = SessionOptions::from(config.timeouts);
        options.working_dir = working_dir;

        Self {
            sessions: HashMap::new(),
            configs: config.servers,
            restart_counts: HashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start all configured servers.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(&mut self) -> Vec<(String, McpError)> {
        let (sessions, errors) = lifecycle::spawn_all_sessions(&self.configs, &self.options).await;

        tracing::info!(
            running = sessions.len(),
            failed = errors.len(),
            "tool servers started"
        );

        self.sessions.extend(sessions);
        errors
    }

    /// Start a specific server by name.
    pub async fn start_server(&mut self, name: &str) -> Result<(), McpError> {
        let config = self.configs.get(name).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })?;

        let session = lifecycle::spawn_session(name, config, &self.options).await?;
        if let Some(mut old) = self.sessions.insert(name.to_string(), session) {
            old.shutdown().await;
        }
        Ok(())
    }

    /// Shut down all servers.
    pub async fn shutdown_all(&mut self) {
        lifecycle::shutdown_all_sessions(&mut self.sessions).await;
    }

    /// Shut down a specific server.
    pub async fn shutdown_server(&mut self, name: &str) {
        if let Some(mut session) = self.sessions.remove(name) {
            session.shutdown().await;
        }
    }

    /// Restart a server with backoff, replacing its tool catalog.
    pub async fn restart_server(&mut self, name: &str) -> Result<(), McpError> {
        let config = self.configs.get(name).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })?;

        let previous = self.restart_counts.get(name).copied().unwrap_or(0);

        if let Some(mut old) = self.sessions.remove(name) {
            old.shutdown().await;
        }

        let session = lifecycle::restart_session(name, config, &self.options, previous).await;
        self.restart_counts.insert(name.to_string(), previous + 1);

        let session = session?;
        self.sessions.insert(name.to_string(), session);
        Ok(())
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// A bridge to one running server's tools.
    pub fn bridge(&self, server: &str) -> Result<ToolBridge, McpError> {
        self.session(server)?.bridge()
    }

    /// Invoke a tool on a server; failures yield the bridge's sentinel text.
    pub async fn invoke(&self, server: &str, tool: &str, arguments: Map<String, Value>) -> String {
        match self.bridge(server) {
            Ok(bridge) => bridge.invoke(tool, arguments).await,
            Err(e) => {
                tracing::warn!(server, tool, error = %e, "tool server unavailable");
                super::bridge::NO_RESULT.to_string()
            }
        }
    }

    fn session(&self, name: &str) -> Result<&McpSession, McpError> {
        self.sessions.get(name).ok_or_else(|| McpError::InvalidState {
            name: name.to_string(),
            state: "not running".into(),
        })
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Get the number of running servers.
    pub fn running_server_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the number of tools across all running servers.
    pub fn tool_count(&self) -> usize {
        self.sessions.values().map(|s| s.catalog().len()).sum()
    }

    /// Check if a specific server is running.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    /// Get a list of running server names.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// How many times a server has been restarted.
    pub fn restart_count(&self, name: &str) -> u32 {
        self.restart_counts.get(name).copied().unwrap_or(0)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::TimeoutConfig;

    const SEARCH_SERVER: &str = r#"
read -r line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read -r line
read -r line; echo '{"jsonrpc":"2.0","id":2,"result":{}}'
read -r line; echo '{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"semantic_search","description":"Search the knowledge base"}]}}'
read -r line; echo '{"jsonrpc":"2.0","id":4,"result":{"content":[{"type":"text","text":"Reset your password from the portal."}]}}'
while read -r line; do :; done
"#;

    fn config_with(servers: &[(&str, ServerConfig)]) -> McpServersConfig {
        McpServersConfig {
            servers: servers
                .iter()
                .map(|(name, cfg)| (name.to_string(), cfg.clone()))
                .collect(),
            timeouts: TimeoutConfig {
                init_ms: 5_000,
                call_ms: 5_000,
                shutdown_ms: 2_000,
            },
        }
    }

    #[test]
    fn test_new_client_empty() {
        let client = McpClient::new(McpServersConfig::default(), None);
        assert_eq!(client.running_server_count(), 0);
        assert_eq!(client.tool_count(), 0);
        assert!(client.running_servers().is_empty());
    }

    #[test]
    fn test_configured_servers_sorted() {
        let client = McpClient::new(
            config_with(&[
                ("zeta", ServerConfig::new("npx", &[])),
                ("alpha", ServerConfig::new("npx", &[])),
            ]),
            Some("/srv".into()),
        );
        assert_eq!(client.configured_servers(), vec!["alpha", "zeta"]);
        assert_eq!(client.options().working_dir.as_deref(), Some("/srv"));
        assert_eq!(client.options().call_timeout.as_millis(), 5_000);
    }

    #[tokio::test]
    async fn test_partial_startup_and_invoke() {
        let mut client = McpClient::new(
            config_with(&[
                ("search", ServerConfig::new("sh", &["-c", SEARCH_SERVER])),
                ("tickets", ServerConfig::new("/nonexistent/ticket-server", &[])),
            ]),
            None,
        );

        let errors = client.start_all().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "tickets");
        assert!(client.is_server_running("search"));
        assert!(!client.is_server_running("tickets"));
        assert_eq!(client.tool_count(), 1);

        let args = Map::new();
        let text = client.invoke("search", "semantic_search", args.clone()).await;
        assert_eq!(text, "Reset your password from the portal.");
        assert_eq!(client.invoke("tickets", "get_all_tickets", args).await, "No result");

        client.shutdown_all().await;
        assert_eq!(client.running_server_count(), 0);
    }

    #[tokio::test]
    async fn test_start_unknown_server_is_config_error() {
        let mut client = McpClient::new(McpServersConfig::default(), None);
        let err = client.start_server("nope").await.unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert!(client.bridge("nope").is_err());
    }

    #[tokio::test]
    async fn test_restart_counts_attempts() {
        let mut client = McpClient::new(
            config_with(&[("tickets", ServerConfig::new("/nonexistent/ticket-server", &[]))]),
            None,
        );

        let err = client.restart_server("tickets").await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(client.restart_count("tickets"), 1);
    }
}
