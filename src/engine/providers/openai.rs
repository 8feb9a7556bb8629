// Chainpilot Engine — OpenAI-Compatible Provider
// Handles any OpenAI-compatible chat completion REST API (including
// Azure-hosted deployments) with SSE streaming.

use crate::atoms::error::ProviderError;
use crate::engine::http::{
    is_retryable_status, parse_retry_after, pinned_client, retry_delay, sign_and_log_request,
    update_last_audit_status, CircuitBreaker, MAX_RETRIES,
};
use crate::engine::providers::ChatProvider;
use crate::engine::state::AbortSignal;
use crate::engine::types::{
    truncate_utf8, Message, StreamChunk, StreamOutcome, TokenUsage, ToolCallDelta, ToolDefinition,
    EngineConfig,
};
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::LazyLock;

/// Circuit breaker shared across all OpenAI-compatible requests.
static OPENAI_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

// ── OpenAI provider struct ─────────────────────────────────────────────────

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    is_azure: bool,
}

impl OpenAiProvider {
    pub fn new(config: &EngineConfig) -> Self {
        let base_url = config.base_url.clone();
        let is_azure = base_url.contains(".azure.com");
        OpenAiProvider {
            client: pinned_client(),
            base_url,
            api_key: config.api_key.clone(),
            is_azure,
        }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let mut m = json!({
                    "role": msg.role,
                    "content": msg.content,
                });
                if let Some(tc) = &msg.tool_calls {
                    m["tool_calls"] = json!(tc);
                }
                if let Some(id) = &msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                if let Some(name) = &msg.name {
                    m["name"] = json!(name);
                }
                m
            })
            .collect()
    }

    fn format_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": t.tool_type,
                    "function": {
                        "name": t.function.name,
                        "description": t.function.description,
                        "parameters": t.function.parameters,
                    }
                })
            })
            .collect()
    }

    /// Parse a single SSE data line from an OpenAI-compatible stream.
    fn parse_sse_chunk(data: &str) -> Option<StreamChunk> {
        if data == "[DONE]" {
            return None;
        }

        let v: Value = serde_json::from_str(data).ok()?;

        // Extract the actual model name returned by the API
        let model = v["model"].as_str().map(|s| s.to_string());

        // A chunk carrying only usage data has no choices array — it still
        // counts as content-bearing for loop-termination purposes.
        let (delta_text, finish_reason, tool_calls) = match v["choices"].get(0) {
            Some(choice) => {
                let delta = &choice["delta"];
                let finish_reason = choice["finish_reason"].as_str().map(|s| s.to_string());
                let delta_text = delta["content"].as_str().map(|s| s.to_string());

                let mut tool_calls = Vec::new();
                if let Some(tcs) = delta["tool_calls"].as_array() {
                    for tc in tcs {
                        let index = tc["index"].as_u64().unwrap_or(0) as usize;
                        let id = tc["id"].as_str().map(|s| s.to_string());
                        let func = &tc["function"];
                        tool_calls.push(ToolCallDelta {
                            index,
                            id,
                            function_name: func["name"].as_str().map(|s| s.to_string()),
                            arguments_delta: func["arguments"].as_str().map(|s| s.to_string()),
                        });
                    }
                }
                (delta_text, finish_reason, tool_calls)
            }
            None => (None, None, Vec::new()),
        };

        // Parse usage from the final chunk (OpenAI includes it when
        // stream_options.include_usage is set, and also in the last chunk
        // of standard streams).
        let usage = v.get("usage").and_then(|u| {
            let input = u["prompt_tokens"].as_u64().unwrap_or(0);
            let output = u["completion_tokens"].as_u64().unwrap_or(0);
            if input > 0 || output > 0 {
                Some(TokenUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
                })
            } else {
                None
            }
        });

        if delta_text.is_none()
            && tool_calls.is_empty()
            && finish_reason.is_none()
            && usage.is_none()
            && model.is_none()
        {
            return None;
        }

        Some(StreamChunk {
            delta_text,
            tool_calls,
            finish_reason,
            usage,
            model,
        })
    }
}

// ── ChatProvider implementation ────────────────────────────────────────────

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    /// Send a chat completion request with SSE streaming.
    /// Handles Azure (api-key header + api-version query param) and
    /// standard OpenAI-compatible APIs (Bearer token).
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        model: &str,
        temperature: Option<f64>,
        abort: &AbortSignal,
    ) -> Result<StreamOutcome, ProviderError> {
        let url = if self.is_azure {
            let base = self.base_url.trim_end_matches('/');
            if base.contains('?') {
                format!("{}/chat/completions", base)
            } else {
                format!("{}/chat/completions?api-version=2024-05-01-preview", base)
            }
        } else {
            format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
        };

        let mut body = json!({
            "model": model,
            "messages": Self::format_messages(messages),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }
        if let Some(temp) = temperature {
            body["temperature"] = json!(temp);
        }

        info!("[engine] OpenAI request to {} model={}", url, model);

        // Circuit breaker: reject immediately if too many recent failures
        if let Err(msg) = OPENAI_CIRCUIT.check() {
            return Err(ProviderError::Transport(msg));
        }

        let body_bytes = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::Transport(format!("Body serialization failed: {}", e)))?;

        // Retry loop for transient errors
        let mut last_error = String::new();
        let mut last_status: u16 = 0;
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if abort.is_aborted() {
                return Ok(StreamOutcome { chunks: vec![], aborted: true });
            }
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[engine] OpenAI retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            sign_and_log_request("openai", model, &body_bytes);

            // Azure uses api-key header; everyone else uses Bearer token
            let mut req = self
                .client
                .post(&url)
                .header("Content-Type", "application/json");
            if self.is_azure {
                req = req.header("api-key", &self.api_key);
            } else {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }

            let response = match req.body(body_bytes.clone()).send().await {
                Ok(r) => r,
                Err(e) => {
                    OPENAI_CIRCUIT.record_failure();
                    last_error = format!("HTTP request failed: {}", e);
                    last_status = 0;
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(ProviderError::Transport(last_error));
                }
            };
            update_last_audit_status(response.status().as_u16());

            if !response.status().is_success() {
                let status = response.status().as_u16();
                last_status = status;
                // Parse Retry-After header before consuming body
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                error!(
                    "[engine] OpenAI error {}: {}",
                    status,
                    truncate_utf8(&body_text, 500)
                );

                OPENAI_CIRCUIT.record_failure();

                // Auth errors are never retried
                if status == 401 || status == 403 {
                    return Err(ProviderError::Auth(last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                // Non-retryable API error or retries exhausted
                return if status == 429 {
                    Err(ProviderError::RateLimited {
                        message: last_error,
                        retry_after_secs: retry_after.take(),
                    })
                } else {
                    Err(ProviderError::Api {
                        status,
                        message: last_error,
                    })
                };
            }

            // ── Read SSE stream ──────────────────────────────────────────
            let mut chunks = Vec::new();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                // The abort signal stops the network read immediately;
                // whatever streamed so far goes back to the caller.
                if abort.is_aborted() {
                    info!("[engine] Stream aborted after {} chunks", chunks.len());
                    return Ok(StreamOutcome { chunks, aborted: true });
                }

                let bytes = result
                    .map_err(|e| ProviderError::Transport(format!("Stream read error: {}", e)))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Some(chunk) = Self::parse_sse_chunk(data) {
                            chunks.push(chunk);
                        } else if data == "[DONE]" {
                            OPENAI_CIRCUIT.record_success();
                            return Ok(StreamOutcome { chunks, aborted: false });
                        }
                    }
                }
            }

            OPENAI_CIRCUIT.record_success();
            return Ok(StreamOutcome { chunks, aborted: false });
        }

        // All retries exhausted — classify the last error
        match last_status {
            0 => Err(ProviderError::Transport(last_error)),
            429 => Err(ProviderError::RateLimited {
                message: last_error,
                retry_after_secs: retry_after,
            }),
            s => Err(ProviderError::Api {
                status: s,
                message: last_error,
            }),
        }
    }
}
