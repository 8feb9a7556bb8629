// Chainpilot Engine — Streaming engine events
//
// Everything a UI needs to render a live turn flows through the
// `EventBus`: text deltas, connect prompts, validated markers, tool
// results, completion, and the terminal error channel. Emission is
// fire-and-forget — a slow or absent subscriber never stalls the engine.

use crate::engine::types::{TokenUsage, ToolCall};
use crate::engine::wallet::provider::WalletProviderKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EngineEvent {
    /// A text delta from the model's response stream.
    #[serde(rename = "delta")]
    Delta { run_id: String, text: String },

    /// A wallet-gated tool call is waiting for a connection.
    #[serde(rename = "connect_required")]
    ConnectRequired {
        run_id: String,
        tool_call_id: String,
        operation: String,
        required: Vec<WalletProviderKind>,
    },

    /// An operation passed validation and is about to execute.
    /// UIs use this to gate in-progress indicators.
    #[serde(rename = "tool_validated")]
    ToolValidated { run_id: String, tool_call_id: String },

    /// The model issued a tool call (raw, before execution).
    #[serde(rename = "tool_request")]
    ToolRequest { run_id: String, tool_call: ToolCall },

    /// A tool finished executing.
    #[serde(rename = "tool_result")]
    ToolResult {
        run_id: String,
        tool_call_id: String,
        output: String,
        success: bool,
    },

    /// The full assistant turn is complete.
    #[serde(rename = "complete")]
    Complete {
        run_id: String,
        text: String,
        tool_calls_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Terminal error for the run. Never enters conversation history.
    #[serde(rename = "error")]
    Error { run_id: String, message: String },
}

// ── Event bus ──────────────────────────────────────────────────────────

/// Broadcast pub-sub for engine events. Cheap to clone; every subscriber
/// gets every event emitted after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        EventBus { tx }
    }

    /// Emit an event. No subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
