//! Event envelope and the typed payloads carried inside it.
//!
//! Every event, local or remote, travels as an [`Event`]: a string `type`
//! tag, correlation ids and an opaque JSON `data` payload. The typed enums
//! in this module ([`StreamEvent`], [`StateEvent`], [`MessageEvent`],
//! [`TurnEvent`], [`ConnectionEvent`], [`ErrorEvent`]) convert into and out of
//! that envelope. Envelopes whose type no enum knows are kept as-is, so newer
//! peers can send event types older consumers simply ignore.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names, grouped by layer.
pub mod kind {
    // Stream layer
    pub const MESSAGE_START: &str = "message_start";
    pub const TEXT_DELTA: &str = "text_delta";
    pub const INPUT_JSON_DELTA: &str = "input_json_delta";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const MESSAGE_STOP: &str = "message_stop";
    pub const INTERRUPTED: &str = "interrupted";

    // State layer
    pub const AGENT_INITIALIZING: &str = "agent_initializing";
    pub const AGENT_READY: &str = "agent_ready";
    pub const CONVERSATION_QUEUED: &str = "conversation_queued";
    pub const CONVERSATION_START: &str = "conversation_start";
    pub const CONVERSATION_THINKING: &str = "conversation_thinking";
    pub const CONVERSATION_RESPONDING: &str = "conversation_responding";
    pub const CONVERSATION_END: &str = "conversation_end";
    pub const CONVERSATION_INTERRUPTED: &str = "conversation_interrupted";
    pub const TOOL_PLANNED: &str = "tool_planned";
    pub const TOOL_EXECUTING: &str = "tool_executing";
    pub const TOOL_COMPLETED: &str = "tool_completed";
    pub const TOOL_FAILED: &str = "tool_failed";
    pub const ERROR_OCCURRED: &str = "error_occurred";

    // Message layer
    pub const USER_MESSAGE: &str = "user_message";
    pub const ASSISTANT_MESSAGE: &str = "assistant_message";
    pub const TOOL_CALL_MESSAGE: &str = "tool_call_message";
    pub const TOOL_RESULT_MESSAGE: &str = "tool_result_message";

    // Turn layer
    pub const TURN_REQUEST: &str = "turn_request";
    pub const TURN_RESPONSE: &str = "turn_response";

    // Connection layer
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const RECONNECTING: &str = "reconnecting";

    pub const ERROR: &str = "error";

    pub const STREAM: &[&str] = &[
        MESSAGE_START,
        TEXT_DELTA,
        INPUT_JSON_DELTA,
        TOOL_CALL,
        TOOL_RESULT,
        MESSAGE_STOP,
        INTERRUPTED,
    ];

    pub const STATE: &[&str] = &[
        AGENT_INITIALIZING,
        AGENT_READY,
        CONVERSATION_QUEUED,
        CONVERSATION_START,
        CONVERSATION_THINKING,
        CONVERSATION_RESPONDING,
        CONVERSATION_END,
        CONVERSATION_INTERRUPTED,
        TOOL_PLANNED,
        TOOL_EXECUTING,
        TOOL_COMPLETED,
        TOOL_FAILED,
        ERROR_OCCURRED,
    ];

    pub const MESSAGE: &[&str] = &[
        USER_MESSAGE,
        ASSISTANT_MESSAGE,
        TOOL_CALL_MESSAGE,
        TOOL_RESULT_MESSAGE,
    ];

    pub const TURN: &[&str] = &[TURN_REQUEST, TURN_RESPONSE];

    pub const CONNECTION: &[&str] = &[CONNECTED, DISCONNECTED, RECONNECTING];
}

/// The layer an event type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLayer {
    Stream,
    State,
    Message,
    Turn,
    Connection,
    Error,
    Unknown,
}

impl EventLayer {
    pub fn of(event_type: &str) -> Self {
        if kind::STREAM.contains(&event_type) {
            EventLayer::Stream
        } else if kind::STATE.contains(&event_type) {
            EventLayer::State
        } else if kind::MESSAGE.contains(&event_type) {
            EventLayer::Message
        } else if kind::TURN.contains(&event_type) {
            EventLayer::Turn
        } else if kind::CONNECTION.contains(&event_type) {
            EventLayer::Connection
        } else if event_type == kind::ERROR {
            EventLayer::Error
        } else {
            EventLayer::Unknown
        }
    }
}

impl std::fmt::Display for EventLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLayer::Stream => write!(f, "stream"),
            EventLayer::State => write!(f, "state"),
            EventLayer::Message => write!(f, "message"),
            EventLayer::Turn => write!(f, "turn"),
            EventLayer::Connection => write!(f, "connection"),
            EventLayer::Error => write!(f, "error"),
            EventLayer::Unknown => write!(f, "unknown"),
        }
    }
}

/// Immutable event envelope. This is also the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            agent_id: None,
            session_id: None,
            container_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn from_payload<P: EventPayload>(payload: &P) -> Self {
        let (event_type, data) = payload.to_parts();
        Self::new(event_type, data)
    }

    /// Decode the payload as `P`. `None` when the type belongs to another
    /// payload family or the data does not match the expected shape.
    pub fn decode<P: EventPayload>(&self) -> Option<P> {
        P::from_parts(&self.event_type, &self.data)
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Copy the correlation ids of `other` onto this event.
    pub fn correlated_with(mut self, other: &Event) -> Self {
        self.agent_id = other.agent_id.clone();
        self.session_id = other.session_id.clone();
        self.container_id = other.container_id.clone();
        self
    }

    pub fn layer(&self) -> EventLayer {
        EventLayer::of(&self.event_type)
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    pub fn belongs_to(&self, agent_id: &str) -> bool {
        self.agent_id.as_deref() == Some(agent_id)
    }
}

/// A typed payload that can be packed into and unpacked from an [`Event`].
pub trait EventPayload: Sized {
    fn to_parts(&self) -> (String, Value);
    fn from_parts(event_type: &str, data: &Value) -> Option<Self>;
}

fn tagged_to_parts<T: Serialize>(payload: &T) -> (String, Value) {
    match serde_json::to_value(payload) {
        Ok(Value::Object(mut map)) => {
            let event_type = map
                .remove("type")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            (event_type, map.remove("data").unwrap_or(Value::Null))
        }
        _ => (String::new(), Value::Null),
    }
}

fn tagged_from_parts<T: DeserializeOwned>(
    family: &[&str],
    event_type: &str,
    data: &Value,
) -> Option<T> {
    if !family.contains(&event_type) {
        return None;
    }
    let mut map = serde_json::Map::new();
    map.insert("type".to_string(), Value::String(event_type.to_string()));
    if !data.is_null() {
        map.insert("data".to_string(), data.clone());
    }
    serde_json::from_value(Value::Object(map)).ok()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Fine-grained deltas produced while a model response is streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum StreamEvent {
    MessageStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        tool_call_id: String,
        partial_json: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    MessageStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Interrupted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload for StreamEvent {
    fn to_parts(&self) -> (String, Value) {
        tagged_to_parts(self)
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        tagged_from_parts(kind::STREAM, event_type, data)
    }
}

/// Coarse lifecycle transitions of an agent and its current turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum StateEvent {
    AgentInitializing {},
    AgentReady {},
    ConversationQueued {
        message_id: String,
    },
    ConversationStart {
        message_id: String,
    },
    ConversationThinking {},
    ConversationResponding {},
    ConversationEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
    ConversationInterrupted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ToolPlanned {
        tool_call_id: String,
        name: String,
    },
    ToolExecuting {
        tool_call_id: String,
        name: String,
    },
    ToolCompleted {
        tool_call_id: String,
        name: String,
    },
    ToolFailed {
        tool_call_id: String,
        name: String,
        error: String,
    },
    ErrorOccurred {
        code: String,
        message: String,
    },
}

impl EventPayload for StateEvent {
    fn to_parts(&self) -> (String, Value) {
        tagged_to_parts(self)
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        tagged_from_parts(kind::STATE, event_type, data)
    }
}

/// Fully assembled, persistable conversation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum MessageEvent {
    UserMessage {
        id: String,
        content: String,
    },
    AssistantMessage {
        id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
    ToolCallMessage {
        id: String,
        tool_call_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResultMessage {
        id: String,
        tool_call_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl MessageEvent {
    pub fn user(content: impl Into<String>) -> Self {
        MessageEvent::UserMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MessageEvent::UserMessage { id, .. }
            | MessageEvent::AssistantMessage { id, .. }
            | MessageEvent::ToolCallMessage { id, .. }
            | MessageEvent::ToolResultMessage { id, .. } => id,
        }
    }
}

impl EventPayload for MessageEvent {
    fn to_parts(&self) -> (String, Value) {
        tagged_to_parts(self)
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        tagged_from_parts(kind::MESSAGE, event_type, data)
    }
}

/// Per request/response analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TurnEvent {
    TurnRequest {
        message_id: String,
        content: String,
    },
    TurnResponse {
        message_id: String,
        duration_ms: u64,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
}

impl EventPayload for TurnEvent {
    fn to_parts(&self) -> (String, Value) {
        tagged_to_parts(self)
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        tagged_from_parts(kind::TURN, event_type, data)
    }
}

/// Transport status. Never drives agent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ConnectionEvent {
    Connected {
        channel_id: String,
    },
    Disconnected {
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Reconnecting {
        channel_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
}

impl EventPayload for ConnectionEvent {
    fn to_parts(&self) -> (String, Value) {
        tagged_to_parts(self)
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        tagged_from_parts(kind::CONNECTION, event_type, data)
    }
}

/// Typed error notification, independent of the other layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Always `"error"`.
    #[serde(default = "error_role")]
    pub role: String,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorEvent {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            role: error_role(),
            code: code.into(),
            message: message.into(),
            recoverable,
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

fn error_role() -> String {
    "error".to_string()
}

impl EventPayload for ErrorEvent {
    fn to_parts(&self) -> (String, Value) {
        (
            kind::ERROR.to_string(),
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
    }

    fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        if event_type != kind::ERROR {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }
}

macro_rules! impl_from_payload {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Event {
                fn from(payload: $ty) -> Self {
                    Event::from_payload(&payload)
                }
            }
        )*
    };
}

impl_from_payload!(
    StreamEvent,
    StateEvent,
    MessageEvent,
    TurnEvent,
    ConnectionEvent,
    ErrorEvent
);
