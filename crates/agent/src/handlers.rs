//! Handlers for SDK-shaped agent messages.
//!
//! The SDK wraps raw model stream events as `{"type": "stream_event",
//! "event": {...}}`, reports tool results as `user` messages with
//! `tool_result` content blocks, and closes each run with a `result`
//! message.

use crate::chain::{HandlerOutput, MessageHandler};
use agentwire_core::{ErrorEvent, Event, StreamEvent, TokenUsage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

fn message_type(input: &Value) -> Option<&str> {
    input.get("type").and_then(Value::as_str)
}

struct PendingTool {
    id: String,
    name: String,
    json: String,
}

#[derive(Default)]
struct StreamState {
    tools: HashMap<u64, PendingTool>,
    stop_reason: Option<String>,
    usage: TokenUsage,
}

/// Translates `stream_event` messages. Accumulates partial tool input JSON
/// per content block and emits one `tool_call` when the block stops.
#[derive(Default)]
pub struct StreamEventHandler {
    state: Mutex<StreamState>,
}

impl StreamEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn translate(&self, event: &Value) -> Vec<StreamEvent> {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
        let mut state = self.state.lock();

        match kind {
            "message_start" => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                *state = StreamState::default();
                state.usage.input_tokens = message
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                vec![StreamEvent::MessageStart {
                    message_id: message
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    model: message.get("model").and_then(Value::as_str).map(str::to_string),
                }]
            }
            "content_block_start" => {
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    state.tools.insert(
                        index,
                        PendingTool {
                            id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                            name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                            json: String::new(),
                        },
                    );
                }
                Vec::new()
            }
            "content_block_delta" => {
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => vec![StreamEvent::TextDelta {
                        text: delta.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                    }],
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        match state.tools.get_mut(&index) {
                            Some(tool) => {
                                tool.json.push_str(&partial);
                                vec![StreamEvent::InputJsonDelta {
                                    tool_call_id: tool.id.clone(),
                                    partial_json: partial,
                                }]
                            }
                            None => {
                                debug!(index, "input_json_delta for unknown block");
                                Vec::new()
                            }
                        }
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => match state.tools.remove(&index) {
                Some(tool) => {
                    let input = if tool.json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&tool.json).unwrap_or_else(|e| {
                            warn!(tool = %tool.name, error = %e, "Tool input is not valid JSON");
                            Value::String(tool.json.clone())
                        })
                    };
                    vec![StreamEvent::ToolCall {
                        id: tool.id,
                        name: tool.name,
                        input,
                    }]
                }
                None => Vec::new(),
            },
            "message_delta" => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    state.stop_reason = Some(reason.to_string());
                }
                if let Some(out) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    state.usage.output_tokens = out;
                }
                Vec::new()
            }
            "message_stop" => vec![StreamEvent::MessageStop {
                stop_reason: state.stop_reason.take(),
                usage: Some(state.usage),
            }],
            _ => Vec::new(),
        }
    }
}

impl MessageHandler for StreamEventHandler {
    fn name(&self) -> &str {
        "stream_event"
    }

    fn can_handle(&self, input: &Value) -> bool {
        message_type(input) == Some("stream_event")
    }

    fn handle(&self, input: &Value) -> HandlerOutput {
        let Some(event) = input.get("event") else {
            return HandlerOutput::None;
        };
        self.translate(event)
            .into_iter()
            .map(Event::from)
            .collect::<Vec<_>>()
            .into()
    }
}

/// Emits one `tool_result` per `tool_result` block of a `user` message.
#[derive(Default)]
pub struct ToolResultHandler;

impl MessageHandler for ToolResultHandler {
    fn name(&self) -> &str {
        "tool_result"
    }

    fn can_handle(&self, input: &Value) -> bool {
        message_type(input) == Some("user")
            && input
                .pointer("/message/content")
                .and_then(Value::as_array)
                .is_some_and(|blocks| {
                    blocks
                        .iter()
                        .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
                })
    }

    fn handle(&self, input: &Value) -> HandlerOutput {
        let blocks = input
            .pointer("/message/content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|b| {
                Event::from(StreamEvent::ToolResult {
                    tool_call_id: b
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: b.get("content").cloned().unwrap_or(Value::Null),
                    is_error: b.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect::<Vec<_>>()
            .into()
    }
}

/// Turns failed `result` messages into `error` events. Successful results
/// produce nothing; the stream already carried the reply.
#[derive(Default)]
pub struct ResultHandler;

impl MessageHandler for ResultHandler {
    fn name(&self) -> &str {
        "result"
    }

    fn can_handle(&self, input: &Value) -> bool {
        message_type(input) == Some("result")
    }

    fn handle(&self, input: &Value) -> HandlerOutput {
        let subtype = input.get("subtype").and_then(Value::as_str).unwrap_or("success");
        let is_error = input.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        if subtype == "success" && !is_error {
            return HandlerOutput::None;
        }

        let message = input
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                input.get("errors").and_then(Value::as_array).map(|errors| {
                    errors
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
            })
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("agent run ended with {}", subtype));
        let code = subtype.to_uppercase();
        // Hitting the turn limit leaves the session usable.
        let recoverable = subtype == "error_max_turns";
        HandlerOutput::One(ErrorEvent::new(code, message, recoverable).into())
    }
}
