// Chainpilot Engine — Chat Provider Registry
// AnyProvider wraps Box<dyn ChatProvider> so adding a new provider never
// requires modifying a factory enum — just implement the trait.

pub mod openai;

pub use openai::OpenAiProvider;

use crate::atoms::error::{EngineResult, ProviderError};
use crate::engine::state::AbortSignal;
use crate::engine::types::{EngineConfig, Message, StreamOutcome, ToolDefinition};
use async_trait::async_trait;

// ── Provider trait ─────────────────────────────────────────────────────

/// A streaming chat completion backend. The returned outcome carries
/// every parsed chunk; when the abort signal stops the network read
/// mid-stream the outcome is flagged `aborted` and holds the chunks
/// received so far.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        abort: &AbortSignal,
    ) -> Result<StreamOutcome, ProviderError>;
}

// ── Provider factory ───────────────────────────────────────────────────

/// Type-erased chat provider. Callers hold `AnyProvider` and call
/// `.chat_stream()` without knowing which concrete backend is in use.
pub struct AnyProvider(Box<dyn ChatProvider>);

impl AnyProvider {
    /// Construct the concrete provider for an engine config. Every
    /// OpenAI-compatible endpoint (including Azure-hosted ones) goes
    /// through the same wire client.
    pub fn from_config(config: &EngineConfig) -> Self {
        AnyProvider(Box::new(OpenAiProvider::new(config)))
    }

    /// Wrap an already-built provider (scripted backends in tests).
    pub fn from_provider(provider: Box<dyn ChatProvider>) -> Self {
        AnyProvider(provider)
    }

    pub async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        abort: &AbortSignal,
    ) -> EngineResult<StreamOutcome> {
        Ok(self
            .0
            .chat_stream(messages, tools, model, temperature, abort)
            .await?)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}
