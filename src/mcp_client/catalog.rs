//! Tool catalog: the handshake and the discovered tool set.
//!
//! Handshake, each step a blocking call on the session:
//! 1. `initialize`: protocol version, (empty) capabilities, client identity
//! 2. `ping`: liveness; the result is not inspected
//! 3. `tools/list`: `result.tools[]` mapped to `ToolDescriptor`s
//!
//! Malformed entries degrade instead of failing discovery: missing names and
//! descriptions become empty strings, a missing schema means "no schema".

use std::collections::HashMap;

use serde_json::json;

use super::errors::McpError;
use super::rpc::RpcSession;
use super::types::{ClientInfo, InitializeResult, ServerInfo, ToolDescriptor, PROTOCOL_VERSION};

/// Upper bound on `tools/list` pages followed through `nextCursor`.
const MAX_LIST_PAGES: usize = 32;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Tools discovered from one server, in the order the server listed them.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    /// `tool_name → index into tools`.
    index: HashMap<String, usize>,
    server_info: Option<ServerInfo>,
    protocol_version: Option<String>,
}

impl ToolCatalog {
    /// Build a catalog from descriptors. The first descriptor wins when a
    /// name repeats.
    pub fn from_tools(descriptors: Vec<ToolDescriptor>) -> Self {
        let mut catalog = Self::default();
        for tool in descriptors {
            if catalog.index.contains_key(&tool.name) {
                tracing::warn!(tool = %tool.name, "duplicate tool name in tools/list, keeping first");
                continue;
            }
            catalog.index.insert(tool.name.clone(), catalog.tools.len());
            catalog.tools.push(tool);
        }
        catalog
    }

    /// Run the handshake over `rpc` and collect the server's tools.
    pub async fn discover(rpc: &RpcSession, client_info: &ClientInfo) -> Result<Self, McpError> {
        let server = rpc.server_name().to_string();

        // 1. initialize
        let init_value = rpc
            .call(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": client_info,
                })),
            )
            .await?;

        let init: InitializeResult = serde_json::from_value(init_value).unwrap_or_else(|e| {
            tracing::warn!(server = %server, error = %e, "unrecognized initialize result");
            InitializeResult::default()
        });

        rpc.notify("notifications/initialized", None).await?;

        // 2. ping
        rpc.call("ping", Some(json!({}))).await?;

        // 3. tools/list (following pagination cursors)
        let mut descriptors = Vec::new();
        let mut params = json!({});
        for page in 0..MAX_LIST_PAGES {
            let result = rpc.call("tools/list", Some(params)).await?;
            descriptors.extend(parse_tools(&result));

            match result.get("nextCursor").and_then(|c| c.as_str()) {
                Some(cursor) if !cursor.is_empty() => {
                    if page + 1 == MAX_LIST_PAGES {
                        tracing::warn!(server = %server, pages = MAX_LIST_PAGES, "tools/list page limit reached");
                    }
                    params = json!({ "cursor": cursor });
                }
                _ => break,
            }
        }

        let mut catalog = Self::from_tools(descriptors);
        catalog.protocol_version = init.protocol_version;
        catalog.server_info = init.server_info;

        tracing::info!(
            server = %server,
            server_name = ?catalog.server_info.as_ref().and_then(|i| i.name.as_deref()),
            protocol = ?catalog.protocol_version,
            tools = catalog.len(),
            "tool discovery complete"
        );

        Ok(catalog)
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tools, in server order.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Server identity from the initialize response, if it sent one.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Serialize tools in the OpenAI function-calling format.
    ///
    /// Tools without a schema get an empty object schema.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|tool| {
                let parameters = tool
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }
}

/// Map a `tools/list` result to descriptors. No `tools` array means no tools.
fn parse_tools(result: &serde_json::Value) -> Vec<ToolDescriptor> {
    let Some(entries) = result.get("tools").and_then(|t| t.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .map(|entry| {
            let tool = ToolDescriptor::from_value(entry);
            if tool.name.is_empty() {
                tracing::warn!(entry = %entry, "tools/list entry without a name");
            }
            tool
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
