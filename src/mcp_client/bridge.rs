//! ToolBridge: the invocation surface handed to the LLM orchestrator.
//!
//! The orchestrator enumerates the discovered tools (name, description,
//! schema), picks one, and invokes it by name with a JSON argument map.
//! There is one generic entry point; the catalog is only used to reject
//! names the server never advertised. Arguments are passed through
//! unvalidated; the server reports bad arguments itself.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use super::catalog::ToolCatalog;
use super::errors::McpError;
use super::rpc::RpcSession;
use super::types::{ToolCallResult, ToolDescriptor};

/// Returned by [`ToolBridge::invoke`] whenever a call produced no text.
pub const NO_RESULT: &str = "No result";

/// Cheap, clonable handle for invoking one server's tools.
#[derive(Clone)]
pub struct ToolBridge {
    rpc: Arc<RpcSession>,
    catalog: Arc<ToolCatalog>,
}

impl ToolBridge {
    pub fn new(rpc: Arc<RpcSession>, catalog: Arc<ToolCatalog>) -> Self {
        Self { rpc, catalog }
    }

    pub fn server_name(&self) -> &str {
        self.rpc.server_name()
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Every invocable tool.
    pub fn tools(&self) -> &[ToolDescriptor] {
        self.catalog.tools()
    }

    /// Tool definitions in the OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.catalog.to_openai_tools()
    }

    /// Invoke a tool and return the text of its first content item.
    ///
    /// Never fails: any error, or a result without text, yields
    /// [`NO_RESULT`] so one bad call cannot abort an orchestration loop.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> String {
        match self.try_invoke(name, arguments).await {
            Ok(Some(text)) => text,
            Ok(None) => NO_RESULT.to_string(),
            Err(e) => {
                tracing::warn!(
                    server = %self.server_name(),
                    tool = name,
                    error = %e,
                    "tool invocation failed"
                );
                NO_RESULT.to_string()
            }
        }
    }

    /// Invoke a tool, returning `content[0].text` if the result has one.
    pub async fn try_invoke(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<String>, McpError> {
        let result = self.call_raw(name, arguments).await?;
        Ok(first_text(&result))
    }

    /// Invoke a tool and report the outcome as a [`ToolCallResult`].
    ///
    /// Remote errors become `success: false` with `"[code] message"` text;
    /// other failures use the error's display text.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> ToolCallResult {
        let start = Instant::now();
        let outcome = self.call_raw(name, arguments).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                ToolCallResult {
                    tool_name: name.to_string(),
                    success: !is_error,
                    error: if is_error {
                        Some(first_text(&result).unwrap_or_else(|| "tool reported an error".into()))
                    } else {
                        None
                    },
                    result: Some(result),
                    execution_time_ms,
                }
            }
            Err(McpError::RemoteError { code, message, .. }) => ToolCallResult {
                tool_name: name.to_string(),
                success: false,
                result: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms,
            },
            Err(e) => ToolCallResult {
                tool_name: name.to_string(),
                success: false,
                result: None,
                error: Some(e.to_string()),
                execution_time_ms,
            },
        }
    }

    async fn call_raw(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        if !self.catalog.contains(name) {
            return Err(McpError::UnknownTool {
                name: name.to_string(),
            });
        }

        tracing::info!(server = %self.server_name(), tool = name, "calling tool");

        let result = self
            .rpc
            .call(
                "tools/call",
                Some(json!({
                    "name": name,
                    "arguments": arguments,
                })),
            )
            .await?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            tracing::warn!(server = %self.server_name(), tool = name, "tool reported isError");
        }

        Ok(result)
    }
}

/// `result.content[0].text`, if present.
fn first_text(result: &serde_json::Value) -> Option<String> {
    result
        .get("content")?
        .get(0)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{FakeServer, Reply};

    fn catalog(names: &[&str]) -> Arc<ToolCatalog> {
        Arc::new(ToolCatalog::from_tools(
            names
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: format!("{name} tool"),
                    input_schema: None,
                })
                .collect(),
        ))
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn bridge_with<F>(names: &[&str], handler: F) -> (ToolBridge, FakeServer)
    where
        F: FnMut(&crate::mcp_client::test_support::RecordedRequest) -> Reply + Send + 'static,
    {
        let (rpc, server) = FakeServer::spawn(handler);
        (ToolBridge::new(Arc::new(rpc), catalog(names)), server)
    }

    #[tokio::test]
    async fn test_invoke_returns_first_text() {
        let (bridge, server) =
            bridge_with(&["echo"], |_| Reply::result(json!({"content": [{"text": "hi"}]})));

        let text = bridge.invoke("echo", args(json!({"text": "hi"}))).await;
        assert_eq!(text, "hi");

        let request = &server.requests()[0];
        assert_eq!(request.method, "tools/call");
        assert_eq!(request.params["name"], "echo");
        assert_eq!(request.params["arguments"], json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_missing_content_yields_sentinel() {
        let (bridge, _server) = bridge_with(&["echo"], |_| Reply::result(json!({})));
        assert_eq!(bridge.invoke("echo", args(json!({}))).await, NO_RESULT);
        assert_eq!(bridge.try_invoke("echo", args(json!({}))).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_error_yields_sentinel() {
        let (bridge, _server) =
            bridge_with(&["echo"], |_| Reply::error(json!({"code": -1, "message": "boom"})));

        assert_eq!(bridge.invoke("echo", args(json!({}))).await, NO_RESULT);

        let err = bridge.try_invoke("echo", args(json!({}))).await.unwrap_err();
        assert!(matches!(err, McpError::RemoteError { code: -1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected_locally() {
        let (bridge, server) = bridge_with(&["echo"], |_| Reply::result(json!({})));

        assert_eq!(bridge.invoke("delete_everything", args(json!({}))).await, NO_RESULT);
        let err = bridge
            .try_invoke("delete_everything", args(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_reports_remote_error_text() {
        let (bridge, _server) = bridge_with(&["get_ticket_by_id"], |_| {
            Reply::error(json!({"code": -32602, "message": "ticketId must be an integer"}))
        });

        let result = bridge
            .call_tool("get_ticket_by_id", args(json!({"ticketId": "abc"})))
            .await;
        assert!(!result.success);
        assert_eq!(result.tool_name, "get_ticket_by_id");
        assert_eq!(
            result.error.as_deref(),
            Some("[-32602] ticketId must be an integer")
        );
    }

    #[tokio::test]
    async fn test_call_tool_flags_is_error_results() {
        let (bridge, _server) = bridge_with(&["get_ticket_by_id"], |_| {
            Reply::result(json!({
                "content": [{"type": "text", "text": "{\"error\":\"Ticket not found\"}"}],
                "isError": true
            }))
        });

        let result = bridge
            .call_tool("get_ticket_by_id", args(json!({"ticketId": 9999})))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("{\"error\":\"Ticket not found\"}"));
        assert!(result.result.is_some());
    }

    #[tokio::test]
    async fn test_call_tool_success() {
        let (bridge, _server) = bridge_with(&["get_all_tickets"], |_| {
            Reply::result(json!({"content": [{"type": "text", "text": "[]"}]}))
        });

        let result = bridge.call_tool("get_all_tickets", args(json!({}))).await;
        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.result.unwrap()["content"][0]["text"], "[]");
    }

    #[tokio::test]
    async fn test_clones_share_the_session() {
        let (bridge, server) =
            bridge_with(&["echo"], |req| Reply::result(json!({"content": [{"text": req.id}]})));
        let other = bridge.clone();

        // Non-string text is not text.
        assert_eq!(bridge.invoke("echo", args(json!({}))).await, NO_RESULT);
        assert_eq!(other.invoke("echo", args(json!({}))).await, NO_RESULT);

        let ids: Vec<_> = server.requests().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_first_text_shapes() {
        assert_eq!(
            first_text(&json!({"content": [{"text": "a"}, {"text": "b"}]})).as_deref(),
            Some("a")
        );
        assert_eq!(first_text(&json!({"content": []})), None);
        assert_eq!(first_text(&json!({"content": [{"type": "image"}]})), None);
    }
}
