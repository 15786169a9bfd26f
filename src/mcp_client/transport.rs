//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with a tool-server child process:
//! - Spawning the process with all three stdio streams piped
//! - Writing newline-terminated frames to stdin
//! - Reading newline-terminated frames from stdout
//! - Bounded teardown of the process

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::config::ServerConfig;
use super::errors::McpError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Line Framing ────────────────────────────────────────────────────────────

/// Write half of the line-delimited transport.
///
/// Frames are written under a lock so concurrent writers never interleave.
/// Once closed (explicitly or by a broken pipe) every write fails with
/// `TransportClosed`.
pub struct LineWriter {
    server_name: String,
    inner: Mutex<Option<BoxedWriter>>,
}

impl LineWriter {
    pub fn new<W>(server_name: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            inner: Mutex::new(Some(Box::new(writer))),
        }
    }

    /// Write one frame followed by `\n` and flush immediately.
    pub async fn write_line(&self, text: &str) -> Result<(), McpError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::TransportClosed {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;

        let mut frame = String::with_capacity(text.len() + 1);
        frame.push_str(text);
        frame.push('\n');

        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            // A failed write means the pipe is gone; later writes fail fast.
            *guard = None;
            return Err(McpError::TransportClosed {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            });
        }

        Ok(())
    }

    /// Close the stream. The child sees end-of-file on its stdin.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Read half of the line-delimited transport.
pub struct LineReader {
    server_name: String,
    inner: BufReader<BoxedReader>,
}

impl LineReader {
    pub fn new<R>(server_name: &str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            inner: BufReader::new(Box::new(reader)),
        }
    }

    /// Read the next raw frame without its line terminator.
    ///
    /// Returns `Ok(None)` at end-of-stream (the child closed stdout). Only
    /// I/O failures are errors; the bytes are not checked for UTF-8.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, McpError> {
        let mut frame = Vec::new();
        let bytes_read = self
            .inner
            .read_until(b'\n', &mut frame)
            .await
            .map_err(|e| McpError::TransportClosed {
                server: self.server_name.clone(),
                reason: format!("failed to read from stdout: {e}"),
            })?;

        if bytes_read == 0 {
            return Ok(None);
        }

        while matches!(frame.last(), Some(b'\n' | b'\r')) {
            frame.pop();
        }
        Ok(Some(frame))
    }

    /// Read the next frame as text.
    ///
    /// A frame that is not UTF-8 is a `ProtocolError`; the stream stays
    /// usable and the next call reads the following line.
    pub async fn read_line(&mut self) -> Result<Option<String>, McpError> {
        match self.read_frame().await? {
            Some(frame) => decode_frame(&self.server_name, frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Decode one stdout frame, rejecting invalid UTF-8.
pub(crate) fn decode_frame(server_name: &str, frame: Vec<u8>) -> Result<String, McpError> {
    String::from_utf8(frame).map_err(|e| McpError::ProtocolError {
        server: server_name.to_string(),
        reason: format!("response line is not valid UTF-8: {}", e.utf8_error()),
    })
}

// ─── ProcessTransport ────────────────────────────────────────────────────────

/// A spawned tool-server process and its stdio pipes.
pub struct ProcessTransport {
    server_name: String,
    /// `None` once the process has been reaped by `shutdown`.
    child: Option<Child>,
    writer: std::sync::Arc<LineWriter>,
    reader: Option<LineReader>,
    stderr: Option<ChildStderr>,
}

impl ProcessTransport {
    /// Spawn the configured command with stdin, stdout and stderr piped.
    ///
    /// The per-server `cwd` overrides the global `working_dir`.
    pub fn start(
        name: &str,
        config: &ServerConfig,
        working_dir: Option<&str>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let effective_dir = config.cwd.as_deref().or(working_dir);
        if let Some(dir) = effective_dir {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = child.stderr.take();

        tracing::debug!(
            server = name,
            command = %config.command,
            pid = ?child.id(),
            "spawned tool server"
        );

        Ok(Self {
            server_name: name.to_string(),
            child: Some(child),
            writer: std::sync::Arc::new(LineWriter::new(name, stdin)),
            reader: Some(LineReader::new(name, stdout)),
            stderr,
        })
    }

    /// Shared handle to the stdin frame writer.
    pub fn writer(&self) -> std::sync::Arc<LineWriter> {
        self.writer.clone()
    }

    /// Take the stdout frame reader. Only the first call returns `Some`.
    pub fn take_reader(&mut self) -> Option<LineReader> {
        self.reader.take()
    }

    /// Take the raw stderr pipe. Only the first call returns `Some`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    pub async fn write_line(&self, text: &str) -> Result<(), McpError> {
        self.writer.write_line(text).await
    }

    /// Read the next stdout frame, unless the reader was handed off.
    pub async fn read_line(&mut self) -> Result<Option<String>, McpError> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_line().await,
            None => Err(McpError::TransportClosed {
                server: self.server_name.clone(),
                reason: "stdout reader was handed off".into(),
            }),
        }
    }

    /// OS process id, while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Close stdin, wait up to `grace` for the process to exit, then kill it.
    ///
    /// Idempotent: later calls return immediately.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.writer.close().await;

        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, %status, "tool server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = grace.as_millis() as u64,
                    "tool server did not exit after stdin closed, killing"
                );
                let _ = child.start_kill();
                let _ = tokio::time::timeout(grace, child.wait()).await;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_line_round_trip_over_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let writer = LineWriter::new("mem", client_write);
        let mut reader = LineReader::new("mem", server_read);

        writer.write_line(r#"{"a":1}"#).await.unwrap();
        writer.write_line("second").await.unwrap();

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_poison_reader() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut reader = LineReader::new("mem", client);

        server.write_all(b"\xff\xfe not utf8\r\n{\"ok\":true}\n").await.unwrap();

        let err = reader.read_line().await.unwrap_err();
        assert!(matches!(err, McpError::ProtocolError { .. }), "got {err:?}");
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(r#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn test_read_frame_keeps_raw_bytes() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut reader = LineReader::new("mem", client);

        server.write_all(b"\xff\n").await.unwrap();
        drop(server);

        assert_eq!(reader.read_frame().await.unwrap(), Some(vec![0xff]));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_reports_end_of_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut reader = LineReader::new("mem", client);
        assert!(reader.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_is_transport_closed() {
        let (client, _server) = tokio::io::duplex(64);
        let writer = LineWriter::new("mem", client);
        writer.close().await;
        assert!(writer.is_closed().await);

        let err = writer.write_line("late").await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ServerConfig {
            command: "definitely-not-a-real-tool-server-binary".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        };
        let err = ProcessTransport::start("tickets", &config, None).err().unwrap();
        match err {
            McpError::SpawnFailed { name, .. } => assert_eq!(name, "tickets"),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_echo_through_child_process() {
        let mut transport = ProcessTransport::start("cat", &sh("cat"), None).unwrap();
        assert!(transport.is_alive());

        transport.write_line("hello").await.unwrap();
        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("hello"));

        transport.shutdown(Duration::from_secs(2)).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_exited_child_yields_end_of_stream() {
        let mut transport = ProcessTransport::start("quit", &sh("exit 0"), None).unwrap();
        assert!(transport.read_line().await.unwrap().is_none());
        transport.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut transport = ProcessTransport::start("cat", &sh("cat"), None).unwrap();
        transport.shutdown(Duration::from_secs(2)).await;
        transport.shutdown(Duration::from_secs(2)).await;

        let err = transport.write_line("late").await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
    }

    #[tokio::test]
    async fn test_unresponsive_child_is_killed() {
        // Ignores stdin EOF, so shutdown has to fall back to kill.
        let mut transport =
            ProcessTransport::start("stubborn", &sh("trap '' TERM; sleep 30"), None).unwrap();
        transport.shutdown(Duration::from_millis(200)).await;
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = sh("echo \"$TOOLBRIDGE_TEST_VALUE\"; pwd");
        config
            .env
            .insert("TOOLBRIDGE_TEST_VALUE".to_string(), "configured".to_string());
        let cwd = dir.path().to_string_lossy().into_owned();

        let mut transport = ProcessTransport::start("env", &config, Some(&cwd)).unwrap();
        assert_eq!(transport.read_line().await.unwrap().as_deref(), Some("configured"));
        let pwd = transport.read_line().await.unwrap().unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&pwd).canonicalize().unwrap(), expected);
        transport.shutdown(Duration::from_secs(2)).await;
    }
}
