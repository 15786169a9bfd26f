//! Toolbridge: drives a tool server over stdio JSON-RPC and exposes its
//! tools to an LLM function-calling orchestrator.
//!
//! ```no_run
//! use toolbridge::mcp_client::{McpSession, ServerConfig, SessionOptions};
//!
//! # async fn run() -> Result<(), toolbridge::mcp_client::McpError> {
//! let config = ServerConfig::new("dotnet", &["run", "--project", "McpServer"]);
//! let mut session = McpSession::new("tickets", config, SessionOptions::default());
//! session.start().await?;
//!
//! let bridge = session.bridge()?;
//! let args = serde_json::json!({"status": "Open"});
//! let text = bridge
//!     .invoke("filter_by_status", args.as_object().cloned().unwrap_or_default())
//!     .await;
//! println!("{text}");
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod mcp_client;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Return the platform-standard log directory for toolbridge.
///
/// Falls back to `./.toolbridge/` when no data directory can be resolved.
pub fn default_log_dir() -> PathBuf {
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("toolbridge").join("logs");
    }
    PathBuf::from(".toolbridge")
}

/// Initialize the tracing subscriber, writing structured logs to `log_dir`.
///
/// On each call:
/// 1. Rotates existing logs (toolbridge.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh toolbridge.log with a line-flushing writer.
/// 3. Logs a startup banner.
///
/// The filter comes from `RUST_LOG`, defaulting to `toolbridge=info,warn`.
/// Setting `TOOLBRIDGE_LOG_FORMAT=json` switches to one JSON object per line.
/// Returns the log file path. If a global subscriber is already installed
/// it is left in place.
pub fn init_tracing(log_dir: &Path) -> io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("toolbridge.log");

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("toolbridge=info,warn"));

    let writer = FlushingWriter::new(log_file);
    let json = std::env::var("TOOLBRIDGE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let installed = if json {
        fmt::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .is_ok()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        installed,
        json,
        "=== toolbridge starting ==="
    );

    Ok(log_path)
}

/// Shift `toolbridge.log` to `.1`, `.1` to `.2`, and so on, dropping
/// whatever sits at `.{keep}`. Gaps in the chain are fine.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let _ = std::fs::remove_file(rotated_path(base_path, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(rotated_path(base_path, n), rotated_path(base_path, n + 1));
    }
    // No current log on first run; the rename error is expected then.
    let _ = std::fs::rename(base_path, rotated_path(base_path, 1));
}

/// `toolbridge.log` + 2 → `toolbridge.log.2`
fn rotated_path(base_path: &Path, n: u32) -> PathBuf {
    let mut name = base_path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Log file handle shared by every subscriber writer; each write is flushed
/// so a crash never loses the last lines.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        op(&mut *file)
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            let written = file.write(buf)?;
            file.flush()?;
            Ok(written)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
