// Chainpilot Engine — Streaming Chat Loop
// The core orchestration loop: send to model → assemble tool calls →
// execute through the wallet gate → feed results back → repeat until the
// model stops requesting tools.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::events::EngineEvent;
use crate::engine::providers::AnyProvider;
use crate::engine::state::{AbortSignal, EngineState};
use crate::engine::types::{Message, Role, TokenUsage, ToolOutcome, ToolStatus};
use log::{info, warn};
use serde_json::Value;

/// Run a complete chat turn: stream the model's response, execute tool
/// calls strictly in index order, and loop until a round produces zero
/// tool calls or the round cap is hit.
///
/// Emits `EngineEvent`s for real-time streaming to whatever UI sits on
/// the bus. The abort signal stops the network read immediately; partial
/// streamed content is still committed to history on the way out.
pub async fn run_chat_turn(
    state: &EngineState,
    provider: &AnyProvider,
    messages: &mut Vec<Message>,
    run_id: &str,
    abort: &AbortSignal,
) -> EngineResult<String> {
    let max_rounds = state.config.max_tool_rounds;
    let mut round = 0u32;
    let mut last_input_tokens: u64 = 0; // Only the LAST round's input (= actual context size)
    let mut total_output_tokens: u64 = 0; // Sum of all rounds' output tokens
    let mut confirmed_model: Option<String> = None;

    loop {
        round += 1;
        if round > max_rounds {
            warn!("[engine] Max tool rounds ({}) reached, stopping", max_rounds);
            let fallback = format!(
                "I completed {} tool-call rounds but ran out of steps before I could \
                write a final summary. You can continue the conversation to let me finish.",
                max_rounds
            );
            state.events.emit(EngineEvent::Complete {
                run_id: run_id.to_string(),
                text: fallback.clone(),
                tool_calls_count: 0,
                usage: None,
                model: confirmed_model,
            });
            return Ok(fallback);
        }

        info!("[engine] Chat round {}/{} run={}", round, max_rounds, run_id);

        // ── 1. Call the model ─────────────────────────────────────────
        // Tool definitions are regenerated from the live registry every
        // round, so operations registered mid-session (e.g. after a
        // wallet or network change) are visible immediately.
        let tools = state.registry.tool_definitions();
        let outcome = match provider
            .chat_stream(
                messages,
                &tools,
                &state.config.model,
                state.config.temperature,
                abort,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transport-level failure of the model request aborts the
                // whole turn; it surfaces on the error channel, never in
                // conversation history.
                state.events.emit(EngineEvent::Error {
                    run_id: run_id.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        // ── 2. Assemble the response from chunks ──────────────────────
        let mut text_accum = String::new();
        for chunk in &outcome.chunks {
            if let Some(model) = &chunk.model {
                confirmed_model.get_or_insert_with(|| model.clone());
            }
            if let Some(dt) = &chunk.delta_text {
                text_accum.push_str(dt);
                state.events.emit(EngineEvent::Delta {
                    run_id: run_id.to_string(),
                    text: dt.clone(),
                });
            }
            for tc_delta in &chunk.tool_calls {
                state.assembler.apply(tc_delta);
            }
            // Input tokens reflect the full context sent each round, so
            // keep only the last round's value; output tokens are truly
            // incremental and are summed.
            if let Some(usage) = &chunk.usage {
                last_input_tokens = usage.input_tokens;
                total_output_tokens += usage.output_tokens;
            }
        }

        // ── 3. Aborted mid-stream: commit partial content and stop ────
        if outcome.aborted {
            warn!("[engine] Turn aborted at round {} — committing partial content", round);
            if !text_accum.is_empty() {
                messages.push(Message::text(Role::Assistant, text_accum.clone()));
            }
            state.assembler.clear();
            state.events.emit(EngineEvent::Error {
                run_id: run_id.to_string(),
                message: "Request aborted".into(),
            });
            return Ok(text_accum);
        }

        // ── 4. If no tool calls, we're done ──────────────────────────
        let tool_calls = state.assembler.finalize_turn();
        if tool_calls.is_empty() {
            messages.push(Message::text(Role::Assistant, text_accum.clone()));
            let usage = if last_input_tokens > 0 || total_output_tokens > 0 {
                Some(TokenUsage {
                    input_tokens: last_input_tokens,
                    output_tokens: total_output_tokens,
                    total_tokens: last_input_tokens + total_output_tokens,
                })
            } else {
                None
            };
            state.events.emit(EngineEvent::Complete {
                run_id: run_id.to_string(),
                text: text_accum.clone(),
                tool_calls_count: 0,
                usage,
                model: confirmed_model,
            });
            return Ok(text_accum);
        }

        // ── 5. Commit streamed text, then execute each tool call ──────
        if !text_accum.is_empty() {
            messages.push(Message::text(Role::Assistant, text_accum.clone()));
        }

        let tc_count = tool_calls.len();
        for tc in &tool_calls {
            if abort.is_aborted() {
                warn!("[engine] Abort between tool calls — stopping turn");
                state.assembler.clear();
                state.events.emit(EngineEvent::Error {
                    run_id: run_id.to_string(),
                    message: "Request aborted".into(),
                });
                return Ok(text_accum);
            }

            info!("[engine] Tool call: {} id={}", tc.function.name, tc.id);
            state.events.emit(EngineEvent::ToolRequest {
                run_id: run_id.to_string(),
                tool_call: tc.clone(),
            });

            // The raw tool call enters history before its result.
            messages.push(Message::assistant_with_tool_calls(
                String::new(),
                vec![tc.clone()],
            ));

            // Accumulated arguments are opaque until this point; a parse
            // failure is a per-call execution error, never fatal to the
            // loop.
            let parsed: EngineResult<Value> = if tc.function.arguments.trim().is_empty() {
                Ok(Value::Object(serde_json::Map::new()))
            } else {
                serde_json::from_str(&tc.function.arguments).map_err(|e| {
                    EngineError::operation(
                        tc.function.name.as_str(),
                        format!("malformed tool arguments: {}", e),
                    )
                })
            };

            let result = match parsed {
                Ok(args) => {
                    state
                        .orchestrator
                        .execute(run_id, &tc.id, &tc.function.name, &args)
                        .await
                }
                Err(e) => Err(e),
            };

            let outcome = match result {
                Ok(info) => ToolOutcome::ok(info),
                Err(e) => ToolOutcome::failed(e.to_string()),
            };
            let success = outcome.status == ToolStatus::Ok;
            let envelope = outcome.to_json();

            info!(
                "[engine] Tool result: {} success={} output_len={}",
                tc.function.name,
                success,
                envelope.len()
            );
            state.events.emit(EngineEvent::ToolResult {
                run_id: run_id.to_string(),
                tool_call_id: tc.id.clone(),
                output: envelope.clone(),
                success,
            });

            messages.push(Message::tool_result(tc.id.as_str(), tc.function.name.as_str(), envelope.as_str()));

            // Result folded into history — the stream is destroyed.
            state.assembler.remove(&tc.id);
        }

        // ── 6. Loop: send tool results back to model ──────────────────
        info!(
            "[engine] {} tool calls executed, feeding results back to model",
            tc_count
        );
        // NOTE: Complete is only emitted when the model produces a final
        // text response (no more tool calls) — intermediate rounds stay
        // open on the frontend.
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
