//! In-memory fake tool server for protocol tests.
//!
//! Speaks line-delimited JSON-RPC over a `tokio::io::duplex` pipe, records
//! every frame it receives and answers requests through a handler closure.
//! Notifications (frames without an id) are recorded but never answered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use super::rpc::RpcSession;
use super::transport::{LineReader, LineWriter};

/// One frame received by the fake server.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub id: Option<u64>,
    pub method: String,
    pub params: Value,
    pub raw: String,
}

/// How the fake server answers a request.
pub(crate) enum Reply {
    /// `{"jsonrpc":"2.0","id":<id>,"result":<value>}`
    Result(Value),
    /// `{"jsonrpc":"2.0","id":<id>,"error":<value>}`
    Error(Value),
    /// Written verbatim (may contain several lines).
    Raw(String),
    /// Written verbatim, for bytes that are not UTF-8.
    Bytes(Vec<u8>),
    /// Never answered.
    Silent,
    /// Close the pipe, as if the process exited.
    Hangup,
}

impl Reply {
    pub fn result(value: Value) -> Self {
        Reply::Result(value)
    }

    pub fn error(value: Value) -> Self {
        Reply::Error(value)
    }
}

pub(crate) struct FakeServer {
    log: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    /// Start a fake server and an `RpcSession` connected to it.
    pub fn spawn<F>(handler: F) -> (RpcSession, FakeServer)
    where
        F: FnMut(&RecordedRequest) -> Reply + Send + 'static,
    {
        Self::spawn_reordering(1, handler)
    }

    /// Like `spawn`, but holds replies until `batch` of them are ready and
    /// then writes them newest-first.
    pub fn spawn_reordering<F>(batch: usize, handler: F) -> (RpcSession, FakeServer)
    where
        F: FnMut(&RecordedRequest) -> Reply + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);

        let rpc = RpcSession::start(
            "fake",
            Arc::new(LineWriter::new("fake", client_write)),
            LineReader::new("fake", client_read),
            Duration::from_secs(5),
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(server, batch.max(1), handler, log.clone()));

        (rpc, FakeServer { log, task })
    }

    /// Every frame received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().unwrap().clone()
    }

    /// Methods of every frame received so far, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.method).collect()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<F>(
    stream: DuplexStream,
    batch: usize,
    mut handler: F,
    log: Arc<Mutex<Vec<RecordedRequest>>>,
) where
    F: FnMut(&RecordedRequest) -> Reply + Send + 'static,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut queued: Vec<Vec<u8>> = Vec::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(value) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let request = RecordedRequest {
            id: value.get("id").and_then(Value::as_u64),
            method: value["method"].as_str().unwrap_or_default().to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
            raw: line.clone(),
        };
        log.lock().unwrap().push(request.clone());

        let Some(id) = request.id else {
            continue;
        };

        let frame = match handler(&request) {
            Reply::Result(result) => {
                json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string().into_bytes()
            }
            Reply::Error(error) => {
                json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string().into_bytes()
            }
            Reply::Raw(raw) => raw.into_bytes(),
            Reply::Bytes(bytes) => bytes,
            Reply::Silent => continue,
            Reply::Hangup => return,
        };

        queued.push(frame);
        if queued.len() >= batch {
            for frame in queued.drain(..).rev() {
                if write.write_all(&frame).await.is_err()
                    || write.write_all(b"\n").await.is_err()
                {
                    return;
                }
            }
            let _ = write.flush().await;
        }
    }
}
