// Chainpilot Engine — Tool-Call Stream Assembler
//
// Merges the partial function-call fragments of a streamed model turn
// into complete, invocable tool calls. Fragments sharing an `index`
// belong to one call; the first fragment creates the entry, later ones
// append their arguments text verbatim. Arguments are opaque bytes until
// the turn ends — fragments can split mid-token, so nothing here ever
// parses JSON. Malformed trailing arguments surface at execution time.

use crate::engine::types::{FunctionCall, ToolCall, ToolCallDelta};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// One in-flight tool call being reassembled from stream fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallStream {
    /// Stable identifier once the provider supplies it; may start empty.
    pub id: String,
    /// Position within the current model turn.
    pub index: usize,
    /// May arrive empty and be set by a later fragment.
    pub function_name: String,
    /// Append-only accumulation buffer, never rewritten.
    pub arguments_text: String,
}

impl ToolCallStream {
    /// A stream is complete once both id and name are known.
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.function_name.is_empty()
    }
}

/// Folds `ToolCallDelta` fragments into per-index streams and publishes
/// the live set to observers after every mutation.
pub struct ToolCallAssembler {
    streams: Mutex<BTreeMap<usize, ToolCallStream>>,
    tx: watch::Sender<Vec<ToolCallStream>>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        ToolCallAssembler {
            streams: Mutex::new(BTreeMap::new()),
            tx,
        }
    }

    /// Fold one fragment into its stream, creating the entry on first
    /// sight of the index. Arguments fragments are concatenated in
    /// arrival order.
    pub fn apply(&self, delta: &ToolCallDelta) {
        let mut streams = self.streams.lock();
        let entry = streams.entry(delta.index).or_insert_with(|| ToolCallStream {
            id: String::new(),
            index: delta.index,
            function_name: String::new(),
            arguments_text: String::new(),
        });
        if let Some(id) = &delta.id {
            entry.id = id.clone();
        }
        if let Some(name) = &delta.function_name {
            entry.function_name = name.clone();
        }
        if let Some(args) = &delta.arguments_delta {
            entry.arguments_text.push_str(args);
        }
        self.publish(&streams);
    }

    /// Current snapshot of all in-flight streams, index order.
    pub fn snapshot(&self) -> Vec<ToolCallStream> {
        self.tx.borrow().clone()
    }

    /// Observe the live set; a new snapshot is published on every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ToolCallStream>> {
        self.tx.subscribe()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Close out a model turn: assign a generated id to any named stream
    /// the provider left id-less, drop streams that never received a
    /// function name, and return the executable calls in index order.
    /// Streams stay in the set until `remove` folds their result away.
    pub fn finalize_turn(&self) -> Vec<ToolCall> {
        let mut streams = self.streams.lock();
        let mut calls = Vec::new();
        let mut dropped = Vec::new();
        for (index, stream) in streams.iter_mut() {
            if stream.function_name.is_empty() {
                warn!(
                    "[assembler] Dropping tool call at index {} — no function name arrived",
                    index
                );
                dropped.push(*index);
                continue;
            }
            if stream.id.is_empty() {
                stream.id = format!("call_{}", uuid::Uuid::new_v4());
            }
            calls.push(ToolCall {
                id: stream.id.clone(),
                call_type: "function".into(),
                function: FunctionCall {
                    name: stream.function_name.clone(),
                    arguments: stream.arguments_text.clone(),
                },
            });
        }
        for index in dropped {
            streams.remove(&index);
        }
        self.publish(&streams);
        calls
    }

    /// Destroy a stream once its result has been folded into history.
    pub fn remove(&self, id: &str) {
        let mut streams = self.streams.lock();
        streams.retain(|_, s| s.id != id);
        self.publish(&streams);
    }

    /// Drop all streams (turn aborted before execution).
    pub fn clear(&self) {
        let mut streams = self.streams.lock();
        streams.clear();
        self.publish(&streams);
    }

    fn publish(&self, streams: &BTreeMap<usize, ToolCallStream>) {
        let snapshot: Vec<ToolCallStream> = streams.values().cloned().collect();
        // send_replace updates the value even with no live receivers.
        self.tx.send_replace(snapshot);
    }
}

impl Default for ToolCallAssembler {
    fn default() -> Self {
        Self::new()
    }
}
