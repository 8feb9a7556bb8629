// Chainpilot Engine — Core types
// These are the data structures that flow through the entire engine.
// They are independent of any specific chat endpoint or wallet extension.

use serde::{Deserialize, Serialize};

// ── Messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    /// Plain text message with no tool-call bookkeeping.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message that records the raw tool calls of a turn.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool message carrying a result envelope back to the model.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
        }
    }
}

// ── Tool Calling ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

// ── Tool Result Envelope ───────────────────────────────────────────────
// What the model sees back for every executed tool call, JSON-encoded.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub info: String,
}

impl ToolOutcome {
    pub fn ok(info: impl Into<String>) -> Self {
        ToolOutcome { status: ToolStatus::Ok, info: info.into() }
    }

    pub fn failed(info: impl Into<String>) -> Self {
        ToolOutcome { status: ToolStatus::Failed, info: info.into() }
    }

    /// Serialize to the wire envelope. Serialization of two strings cannot
    /// fail, but keep the fallback total anyway.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"status":"failed","info":"envelope serialization failed"}"#.into())
    }
}

// ── Provider API response shapes ───────────────────────────────────────

/// Unified streaming chunk from the chat endpoint.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub delta_text: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// One partial function-call fragment from the stream. Fragments sharing
/// an `index` belong to the same tool call; `arguments_delta` is opaque
/// text until the turn completes.
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub function_name: Option<String>,
    pub arguments_delta: Option<String>,
}

/// Result of one streamed model turn. `aborted` means the network read
/// was stopped early by the abort signal — `chunks` holds whatever
/// arrived before the stop.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub chunks: Vec<StreamChunk>,
    pub aborted: bool,
}

/// Token usage reported by the API (for metering).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

// ── Chain / Network Catalog ────────────────────────────────────────────

/// CAIP-2 style chain namespace an operation or wallet belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainNamespace {
    Eip155,
    Solana,
}

impl ChainNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainNamespace::Eip155 => "eip155",
            ChainNamespace::Solana => "solana",
        }
    }
}

/// One known network: a human name the model can use in tool arguments,
/// plus the underlying namespace-scoped chain id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub namespace: ChainNamespace,
    /// Decimal chain id for eip155, cluster name for solana.
    pub chain_id: String,
    /// RPC endpoint handed to the wallet on an add-chain request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
}

/// The set of networks the engine knows how to name and switch to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCatalog {
    pub networks: Vec<NetworkSpec>,
}

impl NetworkCatalog {
    /// Look up a network by name within a specific namespace.
    pub fn resolve(&self, name: &str, namespace: ChainNamespace) -> Option<&NetworkSpec> {
        self.networks
            .iter()
            .find(|n| n.namespace == namespace && n.name.eq_ignore_ascii_case(name))
    }

    /// Look up a network by name in any namespace (first match wins,
    /// catalog order).
    pub fn resolve_any(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(name))
    }
}

impl Default for NetworkCatalog {
    fn default() -> Self {
        let eip155 = |name: &str, chain_id: &str, rpc: &str| NetworkSpec {
            name: name.into(),
            namespace: ChainNamespace::Eip155,
            chain_id: chain_id.into(),
            rpc_url: Some(rpc.into()),
        };
        NetworkCatalog {
            networks: vec![
                eip155("ethereum", "1", "https://eth.llamarpc.com"),
                eip155("base", "8453", "https://mainnet.base.org"),
                eip155("arbitrum", "42161", "https://arb1.arbitrum.io/rpc"),
                eip155("optimism", "10", "https://mainnet.optimism.io"),
                eip155("polygon", "137", "https://polygon-rpc.com"),
                NetworkSpec {
                    name: "solana".into(),
                    namespace: ChainNamespace::Solana,
                    chain_id: "mainnet-beta".into(),
                    rpc_url: Some("https://api.mainnet-beta.solana.com".into()),
                },
            ],
        }
    }
}

// ── Engine Config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chat completion endpoint base URL (OpenAI-compatible).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f64>,
    /// Network assumed when a tool call's arguments don't name one.
    pub default_network: String,
    /// Safety cap on tool-call rounds within one user turn.
    pub max_tool_rounds: u32,
    /// How long a wallet-gated call waits for a satisfying connection.
    pub connect_wait_secs: u64,
    /// Cap on a single provider account/connect prompt.
    pub connect_request_secs: u64,
    pub networks: NetworkCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            base_url: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o".into(),
            temperature: None,
            default_network: "ethereum".into(),
            max_tool_rounds: 20,
            connect_wait_secs: 300,
            connect_request_secs: 60,
            networks: NetworkCatalog::default(),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes`, respecting char boundaries.
/// Used to keep error bodies and log lines bounded.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
