//! Mealy-style assembly of the coarse event layers.
//!
//! The assembler reads one agent's stream-layer events and derives, one
//! input at a time, the state transitions, the persistable messages and the
//! per-turn analytics. Output depends only on the current state and the
//! input event.

use crate::bus::SystemBus;
use agentwire_core::{
    kind, ErrorEvent, Event, EventPayload, MessageEvent, Result, StateEvent, StreamEvent,
    Subscription, TokenUsage, TurnEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

const INPUTS: &[&str] = &[
    kind::USER_MESSAGE,
    kind::MESSAGE_START,
    kind::TEXT_DELTA,
    kind::TOOL_CALL,
    kind::TOOL_RESULT,
    kind::MESSAGE_STOP,
    kind::INTERRUPTED,
    kind::ERROR,
];

struct Turn {
    message_id: String,
    received: Instant,
    usage: TokenUsage,
}

#[derive(Default)]
struct AssemblyState {
    queued: VecDeque<Turn>,
    active: Option<Turn>,
    assistant_id: Option<String>,
    text: String,
    responding: bool,
    tools: HashMap<String, String>,
}

impl AssemblyState {
    /// The turn the current stream belongs to, starting the oldest queued one
    /// if none is active.
    fn start_turn(&mut self) -> Option<&Turn> {
        if self.active.is_none() {
            self.active = self.queued.pop_front();
            self.active.as_ref()
        } else {
            None
        }
    }

    fn finish_turn(&mut self, stop_reason: Option<String>) -> Option<TurnEvent> {
        let turn = self.active.take().or_else(|| self.queued.pop_front())?;
        self.responding = false;
        self.assistant_id = None;
        self.tools.clear();
        Some(TurnEvent::TurnResponse {
            message_id: turn.message_id,
            duration_ms: turn.received.elapsed().as_millis() as u64,
            usage: turn.usage,
            cost_usd: None,
            stop_reason,
        })
    }

    fn take_assistant(&mut self, stop_reason: Option<String>) -> MessageEvent {
        MessageEvent::AssistantMessage {
            id: self
                .assistant_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content: std::mem::take(&mut self.text),
            stop_reason,
        }
    }
}

/// Per-agent transducer from stream events to state, message and turn
/// events.
pub struct Assembler {
    agent_id: String,
    state: Mutex<AssemblyState>,
}

impl Assembler {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: Mutex::new(AssemblyState::default()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Number of user messages waiting for the driver.
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn in_turn(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// Consume this agent's inputs from `bus` and produce the derived events
    /// back onto it.
    pub fn attach(self: &Arc<Self>, bus: &SystemBus) -> Result<Subscription> {
        let assembler = self.clone();
        let output = bus.clone();
        bus.create_consumer().consume_where(
            {
                let agent_id = self.agent_id.clone();
                move |e: &Event| e.belongs_to(&agent_id) && INPUTS.contains(&e.event_type.as_str())
            },
            move |e: &Event| {
                for derived in assembler.step(e) {
                    output.produce(derived);
                }
            },
        )
    }

    /// Advance the machine by one input. Events for other agents and types
    /// the machine does not read produce nothing.
    pub fn step(&self, input: &Event) -> Vec<Event> {
        if !input.belongs_to(&self.agent_id) {
            return Vec::new();
        }
        let outputs = {
            let mut state = self.state.lock();
            if input.is(kind::USER_MESSAGE) {
                Self::on_user_message(&mut state, input)
            } else if input.is(kind::ERROR) {
                Self::on_error(&mut state, input)
            } else {
                match input.decode::<StreamEvent>() {
                    Some(event) => Self::on_stream(&mut state, event),
                    None => Vec::new(),
                }
            }
        };
        trace!(agent_id = %self.agent_id, input = %input.event_type, outputs = outputs.len(), "assembler step");
        outputs
            .into_iter()
            .map(|event| event.correlated_with(input))
            .collect()
    }

    fn on_user_message(state: &mut AssemblyState, input: &Event) -> Vec<Event> {
        let Some(MessageEvent::UserMessage { id, content }) = input.decode::<MessageEvent>() else {
            return Vec::new();
        };
        state.queued.push_back(Turn {
            message_id: id.clone(),
            received: Instant::now(),
            usage: TokenUsage::default(),
        });
        vec![
            StateEvent::ConversationQueued {
                message_id: id.clone(),
            }
            .into(),
            TurnEvent::TurnRequest {
                message_id: id,
                content,
            }
            .into(),
        ]
    }

    fn on_stream(state: &mut AssemblyState, event: StreamEvent) -> Vec<Event> {
        let mut out: Vec<Event> = Vec::new();
        match event {
            StreamEvent::MessageStart { message_id, .. } => {
                if let Some(turn) = state.start_turn() {
                    out.push(
                        StateEvent::ConversationStart {
                            message_id: turn.message_id.clone(),
                        }
                        .into(),
                    );
                }
                state.assistant_id = Some(message_id);
                state.text.clear();
                state.responding = false;
                out.push(StateEvent::ConversationThinking {}.into());
            }
            StreamEvent::TextDelta { text } => {
                state.text.push_str(&text);
                if !state.responding {
                    state.responding = true;
                    out.push(StateEvent::ConversationResponding {}.into());
                }
            }
            StreamEvent::InputJsonDelta { .. } => {}
            StreamEvent::ToolCall { id, name, input } => {
                state.tools.insert(id.clone(), name.clone());
                out.push(
                    StateEvent::ToolPlanned {
                        tool_call_id: id.clone(),
                        name: name.clone(),
                    }
                    .into(),
                );
                out.push(
                    StateEvent::ToolExecuting {
                        tool_call_id: id.clone(),
                        name: name.clone(),
                    }
                    .into(),
                );
                out.push(
                    MessageEvent::ToolCallMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        tool_call_id: id,
                        name,
                        input,
                    }
                    .into(),
                );
            }
            StreamEvent::ToolResult {
                tool_call_id,
                content,
                is_error,
            } => {
                let name = state.tools.remove(&tool_call_id).unwrap_or_default();
                out.push(if is_error {
                    StateEvent::ToolFailed {
                        tool_call_id: tool_call_id.clone(),
                        name,
                        error: describe(&content),
                    }
                    .into()
                } else {
                    StateEvent::ToolCompleted {
                        tool_call_id: tool_call_id.clone(),
                        name,
                    }
                    .into()
                });
                out.push(
                    MessageEvent::ToolResultMessage {
                        id: uuid::Uuid::new_v4().to_string(),
                        tool_call_id,
                        content,
                        is_error,
                    }
                    .into(),
                );
            }
            StreamEvent::MessageStop { stop_reason, usage } => {
                if let (Some(turn), Some(usage)) = (state.active.as_mut(), usage) {
                    turn.usage.add(&usage);
                }
                let wants_tools = stop_reason.as_deref() == Some("tool_use");
                if !state.text.is_empty() || !wants_tools {
                    out.push(state.take_assistant(stop_reason.clone()).into());
                }
                state.responding = false;
                // A tool_use stop continues the same turn with another message.
                if !wants_tools {
                    out.push(
                        StateEvent::ConversationEnd {
                            stop_reason: stop_reason.clone(),
                        }
                        .into(),
                    );
                    out.extend(state.finish_turn(stop_reason).map(Event::from));
                }
            }
            StreamEvent::Interrupted { reason } => {
                if !state.text.is_empty() {
                    out.push(state.take_assistant(Some("interrupted".to_string())).into());
                }
                out.push(StateEvent::ConversationInterrupted { reason }.into());
                out.extend(
                    state
                        .finish_turn(Some("interrupted".to_string()))
                        .map(Event::from),
                );
            }
        }
        out
    }

    fn on_error(state: &mut AssemblyState, input: &Event) -> Vec<Event> {
        let Some(error) = ErrorEvent::from_parts(&input.event_type, &input.data) else {
            return Vec::new();
        };
        let mut out: Vec<Event> = vec![StateEvent::ErrorOccurred {
            code: error.code,
            message: error.message,
        }
        .into()];
        state.text.clear();
        out.extend(state.finish_turn(Some("error".to_string())).map(Event::from));
        out
    }
}

fn describe(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => "tool failed".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(e: impl Into<Event>) -> Event {
        e.into().with_agent("a1")
    }

    fn run(assembler: &Assembler, inputs: Vec<Event>) -> Vec<Event> {
        inputs.iter().flat_map(|e| assembler.step(e)).collect()
    }

    fn types(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    fn start() -> Event {
        agent(StreamEvent::MessageStart {
            message_id: "msg_1".into(),
            model: None,
        })
    }

    fn text(t: &str) -> Event {
        agent(StreamEvent::TextDelta { text: t.into() })
    }

    fn stop(reason: &str) -> Event {
        agent(StreamEvent::MessageStop {
            stop_reason: Some(reason.into()),
            usage: Some(TokenUsage::new(3, 2)),
        })
    }

    #[test]
    fn test_text_turn() {
        let assembler = Assembler::new("a1");
        let user = MessageEvent::user("hi");
        let user_id = user.id().to_string();
        let out = run(
            &assembler,
            vec![agent(user), start(), text("Echo: "), text("hi"), stop("end_turn")],
        );

        assert_eq!(
            types(&out),
            vec![
                kind::CONVERSATION_QUEUED,
                kind::TURN_REQUEST,
                kind::CONVERSATION_START,
                kind::CONVERSATION_THINKING,
                kind::CONVERSATION_RESPONDING,
                kind::ASSISTANT_MESSAGE,
                kind::CONVERSATION_END,
                kind::TURN_RESPONSE,
            ]
        );
        assert_eq!(
            out[5].decode::<MessageEvent>(),
            Some(MessageEvent::AssistantMessage {
                id: "msg_1".into(),
                content: "Echo: hi".into(),
                stop_reason: Some("end_turn".into()),
            })
        );
        match out[7].decode::<TurnEvent>() {
            Some(TurnEvent::TurnResponse { message_id, usage, .. }) => {
                assert_eq!(message_id, user_id);
                assert_eq!(usage.total(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(out.iter().all(|e| e.belongs_to("a1")));
        assert!(!assembler.in_turn());
    }

    #[test]
    fn test_tool_use_continues_turn() {
        let assembler = Assembler::new("a1");
        let out = run(
            &assembler,
            vec![
                agent(MessageEvent::user("weather?")),
                start(),
                agent(StreamEvent::ToolCall {
                    id: "call_1".into(),
                    name: "weather".into(),
                    input: json!({"city": "Oslo"}),
                }),
                stop("tool_use"),
                agent(StreamEvent::ToolResult {
                    tool_call_id: "call_1".into(),
                    content: json!("rain"),
                    is_error: false,
                }),
                start(),
                text("Rain."),
                stop("end_turn"),
            ],
        );

        assert_eq!(
            types(&out),
            vec![
                kind::CONVERSATION_QUEUED,
                kind::TURN_REQUEST,
                kind::CONVERSATION_START,
                kind::CONVERSATION_THINKING,
                kind::TOOL_PLANNED,
                kind::TOOL_EXECUTING,
                kind::TOOL_CALL_MESSAGE,
                kind::TOOL_COMPLETED,
                kind::TOOL_RESULT_MESSAGE,
                kind::CONVERSATION_THINKING,
                kind::CONVERSATION_RESPONDING,
                kind::ASSISTANT_MESSAGE,
                kind::CONVERSATION_END,
                kind::TURN_RESPONSE,
            ]
        );
        match out[13].decode::<TurnEvent>() {
            Some(TurnEvent::TurnResponse { usage, .. }) => assert_eq!(usage, TokenUsage::new(6, 4)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_tool() {
        let assembler = Assembler::new("a1");
        let out = run(
            &assembler,
            vec![
                agent(StreamEvent::ToolCall {
                    id: "c".into(),
                    name: "shell".into(),
                    input: json!({}),
                }),
                agent(StreamEvent::ToolResult {
                    tool_call_id: "c".into(),
                    content: json!("permission denied"),
                    is_error: true,
                }),
            ],
        );
        assert_eq!(
            out[3].decode::<StateEvent>(),
            Some(StateEvent::ToolFailed {
                tool_call_id: "c".into(),
                name: "shell".into(),
                error: "permission denied".into(),
            })
        );
    }

    #[test]
    fn test_interrupt_keeps_partial_text() {
        let assembler = Assembler::new("a1");
        let out = run(
            &assembler,
            vec![
                agent(MessageEvent::user("long story")),
                start(),
                text("Once upon"),
                agent(StreamEvent::Interrupted { reason: None }),
            ],
        );
        let all = types(&out);
        let tail = &all[all.len() - 3..];
        assert_eq!(
            tail,
            &[kind::ASSISTANT_MESSAGE, kind::CONVERSATION_INTERRUPTED, kind::TURN_RESPONSE]
        );
        match out[out.len() - 3].decode::<MessageEvent>() {
            Some(MessageEvent::AssistantMessage { content, stop_reason, .. }) => {
                assert_eq!(content, "Once upon");
                assert_eq!(stop_reason.as_deref(), Some("interrupted"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_before_stream_closes_queued_turn() {
        let assembler = Assembler::new("a1");
        let out = run(
            &assembler,
            vec![
                agent(MessageEvent::user("hi")),
                agent(ErrorEvent::new("DRIVER_ERROR", "down", true)),
            ],
        );
        assert_eq!(
            types(&out)[2..].to_vec(),
            vec![kind::ERROR_OCCURRED, kind::TURN_RESPONSE]
        );
        assert_eq!(assembler.queued(), 0);
    }

    #[test]
    fn test_second_message_waits_in_queue() {
        let assembler = Assembler::new("a1");
        let first = MessageEvent::user("one");
        let second = MessageEvent::user("two");
        let second_id = second.id().to_string();
        let out = run(
            &assembler,
            vec![agent(first), agent(second), start(), text("x"), stop("end_turn"), start()],
        );
        let starts: Vec<String> = out
            .iter()
            .filter_map(|e| match e.decode::<StateEvent>() {
                Some(StateEvent::ConversationStart { message_id }) => Some(message_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1], second_id);
    }

    #[test]
    fn test_ignores_other_agents() {
        let assembler = Assembler::new("a1");
        let foreign = Event::from(MessageEvent::user("hi")).with_agent("a2");
        assert!(assembler.step(&foreign).is_empty());
        assert!(assembler.step(&Event::new("custom", Value::Null).with_agent("a1")).is_empty());
    }

    #[test]
    fn test_attach_produces_onto_bus() {
        let bus = SystemBus::new();
        let assembler = Arc::new(Assembler::new("a1"));
        let _sub = assembler.attach(&bus).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _rec = bus
            .create_consumer()
            .consume(move |e: &Event| s.lock().push(e.event_type.clone()))
            .unwrap();

        bus.produce(agent(MessageEvent::user("hi")).with_session("s1"));
        assert_eq!(
            *seen.lock(),
            vec![kind::USER_MESSAGE, kind::CONVERSATION_QUEUED, kind::TURN_REQUEST]
        );
    }
}
