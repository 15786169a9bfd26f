//! Background drain for a tool server's stderr.
//!
//! A server that logs faster than anyone reads its stderr pipe eventually
//! blocks on write. The pump keeps the pipe empty, forwards every non-empty
//! line to `tracing`, and remembers the last few lines so a failed startup
//! can report what the server said before dying. Lines are decoded lossily:
//! stderr is free text and a stray non-UTF-8 byte must not stop the drain.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Number of recent stderr lines retained for error reports.
const TAIL_LINES: usize = 20;

/// Truncation limit for the joined tail, in bytes.
const TAIL_MAX_BYTES: usize = 2000;

/// Handle to a running stderr drain task.
pub struct StderrPump {
    server_name: String,
    handle: Option<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl StderrPump {
    /// Spawn the drain task on the current tokio runtime.
    pub fn spawn<R>(server_name: &str, stderr: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        let handle = tokio::spawn(pump(server_name.to_string(), stderr, tail.clone()));

        Self {
            server_name: server_name.to_string(),
            handle: Some(handle),
            tail,
        }
    }

    /// The most recent stderr lines, newline-joined and truncated.
    pub fn recent(&self) -> String {
        let lines = match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };

        let mut joined = lines.join("\n");
        if joined.len() > TAIL_MAX_BYTES {
            let mut cut = TAIL_MAX_BYTES;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        joined
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the drain to reach end-of-stream.
    ///
    /// On expiry the task is aborted; an unresponsive child never hangs
    /// teardown. Idempotent.
    pub async fn join(&mut self, timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            tracing::debug!(
                server = %self.server_name,
                timeout_ms = timeout.as_millis() as u64,
                "stderr pump still running at shutdown, aborting"
            );
            handle.abort();
        }
    }
}

impl Drop for StderrPump {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn pump<R>(server_name: String, stderr: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if line.is_empty() {
                    continue;
                }

                tracing::info!(
                    target: "toolbridge::server_stderr",
                    server = %server_name,
                    "{line}"
                );

                let mut tail = match tail.lock() {
                    Ok(tail) => tail,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "stderr read failed, pump stopping");
                break;
            }
        }
    }

    tracing::debug!(server = %server_name, "stderr closed");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
