use agentwire_core::{MessageRecord, Result, StreamEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of events for one request. An `Err` item ends the request.
pub type DriverStream = BoxStream<'static, Result<StreamEvent>>;

/// Everything a driver needs to answer one user message.
#[derive(Debug, Clone, Default)]
pub struct DriverRequest {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub message_id: String,
    pub content: String,
    /// Conversation so far, oldest first, excluding this message.
    pub history: Vec<MessageRecord>,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
}

impl DriverRequest {
    pub fn new(agent_id: &str, message_id: &str, content: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }
}

/// Streaming request/response contract for a model backend.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, request: DriverRequest) -> Result<DriverStream>;

    /// Stop any stream currently being produced. Safe to call when idle.
    fn abort(&self);

    async fn destroy(&self) {}
}
