//! One tool-server process and its protocol state.
//!
//! `McpSession` ties the pieces together: it spawns the process, starts the
//! JSON-RPC session and the stderr pump, runs the catalog handshake and hands
//! out `ToolBridge`s. State moves through
//! `Uninitialized → Handshaking → Ready → Closed`; a closed session may be
//! started again, which spawns a fresh process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::bridge::ToolBridge;
use super::catalog::ToolCatalog;
use super::config::{ServerConfig, SessionOptions};
use super::errors::McpError;
use super::rpc::RpcSession;
use super::stderr::StderrPump;
use super::transport::ProcessTransport;

/// Bounded wait for the stderr pump at shutdown.
const STDERR_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The live pieces of a started session.
struct Live {
    transport: ProcessTransport,
    rpc: Arc<RpcSession>,
    pump: Option<StderrPump>,
}

/// A tool-server session, exclusively owned by whoever created it.
pub struct McpSession {
    name: String,
    config: ServerConfig,
    options: SessionOptions,
    state: SessionState,
    live: Option<Live>,
    catalog: Arc<ToolCatalog>,
}

impl McpSession {
    pub fn new(name: &str, config: ServerConfig, options: SessionOptions) -> Self {
        Self {
            name: name.to_string(),
            config,
            options,
            state: SessionState::Uninitialized,
            live: None,
            catalog: Arc::new(ToolCatalog::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Spawn the server and perform the handshake.
    ///
    /// On any failure the process is torn down, the session ends up
    /// `Closed`, and the error is returned (`SpawnFailed` or `InitFailed`).
    pub async fn start(&mut self) -> Result<(), McpError> {
        match self.state {
            SessionState::Uninitialized | SessionState::Closed => {}
            state => {
                return Err(McpError::InvalidState {
                    name: self.name.clone(),
                    state: state.to_string(),
                })
            }
        }

        let mut transport = match ProcessTransport::start(
            &self.name,
            &self.config,
            self.options.working_dir.as_deref(),
        ) {
            Ok(transport) => transport,
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        let pump = transport
            .take_stderr()
            .map(|stderr| StderrPump::spawn(&self.name, stderr));

        let Some(reader) = transport.take_reader() else {
            transport.shutdown(self.options.shutdown_timeout).await;
            self.state = SessionState::Closed;
            return Err(McpError::SpawnFailed {
                name: self.name.clone(),
                reason: "stdout reader unavailable".into(),
            });
        };

        let rpc = Arc::new(RpcSession::start(
            &self.name,
            transport.writer(),
            reader,
            self.options.call_timeout,
        ));

        self.live = Some(Live {
            transport,
            rpc: rpc.clone(),
            pump,
        });
        self.state = SessionState::Handshaking;

        tracing::info!(server = %self.name, command = %self.config.command, "starting tool server handshake");

        let handshake = tokio::time::timeout(
            self.options.init_timeout,
            ToolCatalog::discover(&rpc, &self.options.client_info),
        )
        .await;

        let failure = match handshake {
            Ok(Ok(catalog)) => {
                self.catalog = Arc::new(catalog);
                self.state = SessionState::Ready;
                tracing::info!(
                    server = %self.name,
                    tools = self.catalog.len(),
                    "tool server ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "initialization timed out after {}ms",
                self.options.init_timeout.as_millis()
            ),
        };

        // Tear down first so the pump sees end-of-stream and the tail is complete.
        let stderr_ctx = self.teardown().await;
        if !stderr_ctx.is_empty() {
            tracing::warn!(server = %self.name, stderr = %stderr_ctx, "server stderr captured on failure");
        }

        Err(McpError::InitFailed {
            name: self.name.clone(),
            reason: format!("{failure}{}", format_stderr_suffix(&stderr_ctx)),
        })
    }

    /// Discovered tools. Empty until the session is `Ready`.
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.catalog.clone()
    }

    /// A bridge for the orchestrator. Requires `Ready`.
    pub fn bridge(&self) -> Result<ToolBridge, McpError> {
        let rpc = self.ready_rpc()?;
        Ok(ToolBridge::new(rpc, self.catalog.clone()))
    }

    /// Issue a raw JSON-RPC call. Requires `Ready`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let rpc = self.ready_rpc()?;
        rpc.call(method, params).await
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.live.as_mut() {
            Some(live) => live.transport.is_alive() && !live.rpc.is_closed(),
            None => false,
        }
    }

    /// Stop the server. Safe to call repeatedly, before `start`, or after a
    /// failed start.
    pub async fn shutdown(&mut self) {
        if self.live.is_some() {
            tracing::info!(server = %self.name, "shutting down tool server");
        }
        self.teardown().await;
    }

    fn ready_rpc(&self) -> Result<Arc<RpcSession>, McpError> {
        match (&self.live, self.state) {
            (Some(live), SessionState::Ready) => Ok(live.rpc.clone()),
            (_, state) => Err(McpError::InvalidState {
                name: self.name.clone(),
                state: state.to_string(),
            }),
        }
    }

    /// Release everything and return the stderr tail.
    async fn teardown(&mut self) -> String {
        let mut stderr_ctx = String::new();

        if let Some(mut live) = self.live.take() {
            live.rpc.close();
            live.transport.shutdown(self.options.shutdown_timeout).await;
            if let Some(mut pump) = live.pump.take() {
                pump.join(STDERR_JOIN_TIMEOUT).await;
                stderr_ctx = pump.recent();
            }
        }

        if self.state != SessionState::Uninitialized {
            self.state = SessionState::Closed;
        }
        stderr_ctx
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
