//! Tool-server configuration.
//!
//! A config file names each tool server and how to launch it:
//!
//! ```yaml
//! servers:
//!   tickets:
//!     command: dotnet
//!     args: ["run", "--project", "McpServer"]
//!     cwd: ${TICKETS_HOME:-~/tickets}
//! timeouts:
//!   call_ms: 15000
//! ```
//!
//! JSON and YAML are both accepted (chosen by file extension). String values
//! may reference environment variables as `${VAR}` or `${VAR:-default}`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::types::ClientInfo;

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to launch one tool server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the global working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Bounded waits applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeoutConfig {
    /// Whole initialize → ping → tools/list handshake.
    #[serde(default = "default_init_ms")]
    pub init_ms: u64,
    /// A single request/response exchange.
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    /// Grace period for the process to exit after stdin closes.
    #[serde(default = "default_shutdown_ms")]
    pub shutdown_ms: u64,
}

fn default_init_ms() -> u64 {
    30_000
}

fn default_call_ms() -> u64 {
    30_000
}

fn default_shutdown_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_ms: default_init_ms(),
            call_ms: default_call_ms(),
            shutdown_ms: default_shutdown_ms(),
        }
    }
}

/// Top-level tool servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Runtime options for a single session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub init_timeout: Duration,
    pub call_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub client_info: ClientInfo,
    /// Working directory used when the server config has no `cwd`.
    pub working_dir: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(TimeoutConfig::default())
    }
}

impl From<TimeoutConfig> for SessionOptions {
    fn from(timeouts: TimeoutConfig) -> Self {
        Self {
            init_timeout: Duration::from_millis(timeouts.init_ms),
            call_timeout: Duration::from_millis(timeouts.call_ms),
            shutdown_timeout: Duration::from_millis(timeouts.shutdown_ms),
            client_info: ClientInfo::default(),
            working_dir: None,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse a servers configuration file.
///
/// `.yaml`/`.yml` files are parsed as YAML, everything else as JSON.
/// Environment variables are interpolated before parsing.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let config: McpServersConfig = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    for (name, server) in &config.servers {
        if server.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has an empty command"),
            });
        }
    }

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        "loaded tool server config"
    );

    Ok(config)
}

/// Merge base server configs with overrides.
///
/// Override entries **fully replace** base entries for the same server name.
pub fn merge_configs(
    mut base: HashMap<String, ServerConfig>,
    overrides: HashMap<String, ServerConfig>,
) -> HashMap<String, ServerConfig> {
    for (name, override_config) in overrides {
        base.insert(name, override_config);
    }
    base
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}` references.
///
/// Unset variables without a default become empty. An unterminated `${` is
/// left as literal text.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        out.push_str(&resolve_var_expr(&body[..close]));
        rest = &body[close + 1..];
    }

    out.push_str(rest);
    out
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// `~` or `~/…` → home directory. `~user` forms are left alone.
fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{rest}", home.display()),
        None => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
