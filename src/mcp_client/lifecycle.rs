//! Session lifecycle helpers for hosts running several tool servers.
//!
//! Handles starting sessions concurrently, restarting a crashed server with
//! exponential backoff, and shutting everything down.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;

use super::config::{ServerConfig, SessionOptions};
use super::errors::McpError;
use super::session::McpSession;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Create a session and run its handshake.
pub async fn spawn_session(
    name: &str,
    config: &ServerConfig,
    options: &SessionOptions,
) -> Result<McpSession, McpError> {
    let mut session = McpSession::new(name, config.clone(), options.clone());
    session.start().await?;
    Ok(session)
}

/// Start all configured servers concurrently.
///
/// Servers that fail to start are reported, not fatal (partial startup is
/// acceptable).
pub async fn spawn_all_sessions(
    configs: &HashMap<String, ServerConfig>,
    options: &SessionOptions,
) -> (HashMap<String, McpSession>, Vec<(String, McpError)>) {
    let attempts = configs.iter().map(|(name, config)| async move {
        (name.clone(), spawn_session(name, config, options).await)
    });

    let mut sessions = HashMap::new();
    let mut errors = Vec::new();

    for (name, outcome) in join_all(attempts).await {
        match outcome {
            Ok(session) => {
                sessions.insert(name, session);
            }
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "tool server failed to start");
                errors.push((name, e));
            }
        }
    }

    (sessions, errors)
}

/// Delay before restart attempt number `attempt` (0-based): 1s, 2s, 4s.
pub fn restart_delay(attempt: u32) -> Duration {
    RESTART_BASE_DELAY * 2u32.pow(attempt)
}

/// Restart a server with exponential backoff.
///
/// `previous_restarts` is how many restarts this server has already had;
/// once it reaches `MAX_RESTART_ATTEMPTS` no new attempt is made.
pub async fn restart_session(
    name: &str,
    config: &ServerConfig,
    options: &SessionOptions,
    previous_restarts: u32,
) -> Result<McpSession, McpError> {
    if previous_restarts >= MAX_RESTART_ATTEMPTS {
        return Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: MAX_RESTART_ATTEMPTS,
        });
    }

    let delay = restart_delay(previous_restarts);
    tracing::info!(
        server = name,
        attempt = previous_restarts + 1,
        delay_ms = delay.as_millis() as u64,
        "restarting tool server"
    );
    sleep(delay).await;

    spawn_session(name, config, options).await
}

/// Shut down every session.
pub async fn shutdown_all_sessions(sessions: &mut HashMap<String, McpSession>) {
    join_all(sessions.values_mut().map(|session| session.shutdown())).await;
    sessions.clear();
}

// ─── Tests ───────────────────────────────────────────────────────────────────
