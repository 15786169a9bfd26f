//! JSON-RPC 2.0 request/response correlation.
//!
//! Every request gets the next id from a per-session counter (1, 2, 3, …) and
//! registers a waiter in the pending map before its frame is written. A
//! dedicated reader task parses each stdout line and hands it to the waiter
//! with the matching id, so several calls may be in flight at once and
//! responses may arrive in any order.
//!
//! Failure routing:
//! - `error` member → `RemoteError` for that call
//! - empty/unparsable line, or neither `result` nor `error` → `ProtocolError`
//! - stdout end-of-stream → `TransportClosed` for every pending call
//! - no response within the call timeout → `Timeout`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{decode_frame, LineReader, LineWriter};
use super::types::{error_codes, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};

type Waiter = oneshot::Sender<Result<serde_json::Value, McpError>>;

/// State shared between callers and the reader task.
struct Shared {
    server_name: String,
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn closed_error(&self) -> McpError {
        let reason = match self.close_reason.lock() {
            Ok(reason) => reason.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        McpError::TransportClosed {
            server: self.server_name.clone(),
            reason: reason.unwrap_or_else(|| "session closed".into()),
        }
    }

    /// Mark the session closed and fail every outstanding call.
    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.close_reason.lock() {
            Ok(mut slot) => *slot = Some(reason.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(reason.to_string()),
        }

        let drained: Vec<Waiter> = self.lock_pending().drain().map(|(_, w)| w).collect();
        for waiter in drained {
            let _ = waiter.send(Err(self.closed_error()));
        }
    }

    fn complete(&self, id: u64, outcome: Result<serde_json::Value, McpError>) -> bool {
        match self.lock_pending().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Id of the only outstanding call, if exactly one is pending.
    fn sole_pending(&self) -> Option<u64> {
        let pending = self.lock_pending();
        if pending.len() == 1 {
            pending.keys().next().copied()
        } else {
            None
        }
    }
}

/// Removes a call's waiter from the pending map when the call ends, however
/// it ends. A caller that drops the `call` future mid-flight (outer timeout,
/// `select!`, aborted task) leaves nothing behind.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.id);
    }
}

// ─── RpcSession ──────────────────────────────────────────────────────────────

/// A JSON-RPC client bound to one pair of line streams.
pub struct RpcSession {
    shared: Arc<Shared>,
    writer: Arc<LineWriter>,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcSession {
    /// Start the session: spawns the reader task on the current runtime.
    pub fn start(
        server_name: &str,
        writer: Arc<LineWriter>,
        reader: LineReader,
        call_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            server_name: server_name.to_string(),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
        });

        let reader_task = tokio::spawn(read_loop(shared.clone(), reader));

        Self {
            shared,
            writer,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Send a request and wait for its response, using the session's
    /// default timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.call_with_timeout(method, params, self.call_timeout).await
    }

    /// Send a request and wait at most `timeout` for its response.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request).map_err(|e| McpError::ProtocolError {
            server: self.shared.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let (tx, rx) = oneshot::channel();
        self.shared.lock_pending().insert(id, tx);
        let _pending = PendingGuard {
            shared: self.shared.as_ref(),
            id,
        };

        // The reader may have hit end-of-stream between the check above and
        // the insert.
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }

        let start = Instant::now();
        tracing::debug!(server = %self.shared.server_name, id, method, "sending request");

        self.writer.write_line(&json).await?;

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                tracing::warn!(
                    server = %self.shared.server_name,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        tracing::debug!(
            server = %self.shared.server_name,
            id,
            method,
            ok = outcome.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request finished"
        );

        outcome
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }

        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| McpError::ProtocolError {
            server: self.shared.server_name.clone(),
            reason: format!("failed to serialize notification: {e}"),
        })?;

        self.writer.write_line(&json).await
    }

    /// Stop the reader task and fail outstanding calls. Idempotent.
    pub fn close(&self) {
        self.shared.close("session closed by client");

        let task = match self.reader_task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

async fn read_loop(shared: Arc<Shared>, mut reader: LineReader) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch_frame(&shared, frame),
            Ok(None) => {
                tracing::info!(server = %shared.server_name, "server stdout closed");
                shared.close("server stdout closed (process may have exited)");
                return;
            }
            Err(e) => {
                tracing::warn!(server = %shared.server_name, error = %e, "stdout read failed");
                let reason = match e {
                    McpError::TransportClosed { reason, .. } => reason,
                    other => other.to_string(),
                };
                shared.close(&reason);
                return;
            }
        }
    }
}

/// Decode one stdout frame and route it. Bytes that are not UTF-8 take the
/// same path as any other unparsable line.
fn dispatch_frame(shared: &Shared, frame: Vec<u8>) {
    match decode_frame(&shared.server_name, frame) {
        Ok(line) => dispatch_line(shared, &line),
        Err(McpError::ProtocolError { reason, .. }) => unroutable(shared, reason, "<binary>"),
        Err(e) => unroutable(shared, e.to_string(), "<binary>"),
    }
}

/// Route one stdout line to the call waiting for it.
fn dispatch_line(shared: &Shared, line: &str) {
    let trimmed = line.trim();

    let message = if trimmed.is_empty() {
        Err("empty response line".to_string())
    } else {
        serde_json::from_str::<JsonRpcMessage>(trimmed)
            .map_err(|e| format!("unparsable response line: {e}"))
    };

    let message = match message {
        Ok(message) => message,
        Err(reason) => return unroutable(shared, reason, trimmed),
    };

    if message.is_server_message() {
        tracing::debug!(
            server = %shared.server_name,
            method = message.method.as_deref().unwrap_or_default(),
            "ignoring server-initiated message"
        );
        return;
    }

    let id = match message.numeric_id().or_else(|| shared.sole_pending()) {
        Some(id) => id,
        None => {
            tracing::warn!(server = %shared.server_name, id = ?message.id, "response without usable id");
            return;
        }
    };

    let outcome = if let Some(err) = message.error {
        tracing::debug!(
            server = %shared.server_name,
            id,
            code = err.code,
            kind = error_codes::label(err.code),
            "server returned an error"
        );
        Err(McpError::RemoteError {
            code: err.code,
            message: err.message,
            data: err.data,
        })
    } else if let Some(result) = message.result {
        Ok(result)
    } else {
        Err(McpError::ProtocolError {
            server: shared.server_name.clone(),
            reason: "response missing both result and error".into(),
        })
    };

    if !shared.complete(id, outcome) {
        tracing::warn!(server = %shared.server_name, id, "response for unknown request id");
    }
}

/// A line with no id to route by: blame the only outstanding call, if any.
fn unroutable(shared: &Shared, reason: String, line: &str) {
    match shared.sole_pending() {
        Some(id) => {
            shared.complete(
                id,
                Err(McpError::ProtocolError {
                    server: shared.server_name.clone(),
                    reason,
                }),
            );
        }
        None => {
            tracing::warn!(
                server = %shared.server_name,
                reason = %reason,
                line = %truncate(line, 200),
                "dropping unroutable line from server"
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
