//! Test doubles shared across the crate's unit tests.

use agentwire_channels::{AckOptions, Channel, ConnectionState};
use agentwire_core::{
    AgentDefinition, AgentImage, Error, Event, Listener, ListenerSet, MessageRecord, Result,
    Subscription,
};
use agentwire_storage::Repository;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// In-process channel that records what is sent and lets tests inject
/// inbound events.
pub(crate) struct RecordingChannel {
    pub sent: Mutex<Vec<Event>>,
    events: ListenerSet<Event>,
    states: ListenerSet<ConnectionState>,
    state: Mutex<ConnectionState>,
}

impl RecordingChannel {
    pub fn connected() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            events: ListenerSet::new(),
            states: ListenerSet::new(),
            state: Mutex::new(ConnectionState::Connected),
        })
    }

    pub fn inject(&self, event: Event) {
        self.events.emit(&event);
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent.lock().iter().map(|e| e.event_type.clone()).collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn id(&self) -> &str {
        "recording"
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Disconnected;
        self.states.emit(&ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<()> {
        self.sent.lock().push(event.clone());
        Ok(())
    }

    async fn send_with_ack(&self, event: &Event, options: AckOptions) -> Result<()> {
        self.sent.lock().push(event.clone());
        if let Some(on_ack) = options.on_ack {
            on_ack();
        }
        Ok(())
    }

    fn on(&self, handler: Listener<Event>) -> Subscription {
        self.events.add(move |e: &Event| handler(e))
    }

    fn on_state_change(&self, handler: Listener<ConnectionState>) -> Subscription {
        self.states.add(move |s: &ConnectionState| handler(s))
    }
}

pub(crate) async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Repository whose writes always fail.
pub(crate) struct BrokenRepository;

#[async_trait]
impl Repository for BrokenRepository {
    async fn save_image(&self, _: &AgentImage) -> Result<()> {
        Err(Error::Storage("read-only".into()))
    }
    async fn find_image_by_id(&self, _: &str) -> Result<Option<AgentImage>> {
        Ok(None)
    }
    async fn find_all_images(&self) -> Result<Vec<AgentImage>> {
        Ok(Vec::new())
    }
    async fn delete_image(&self, _: &str) -> Result<()> {
        Ok(())
    }
    async fn image_exists(&self, _: &str) -> Result<bool> {
        Ok(false)
    }
    async fn save_definition(&self, _: &AgentDefinition) -> Result<()> {
        Err(Error::Storage("read-only".into()))
    }
    async fn find_definition_by_name(&self, _: &str) -> Result<Option<AgentDefinition>> {
        Ok(None)
    }
    async fn find_all_definitions(&self) -> Result<Vec<AgentDefinition>> {
        Ok(Vec::new())
    }
    async fn delete_definition(&self, _: &str) -> Result<()> {
        Ok(())
    }
    async fn definition_exists(&self, _: &str) -> Result<bool> {
        Ok(false)
    }
    async fn add_message(&self, _: &str, _: &MessageRecord) -> Result<()> {
        Err(Error::Storage("read-only".into()))
    }
    async fn get_messages(&self, _: &str) -> Result<Vec<MessageRecord>> {
        Ok(Vec::new())
    }
    async fn clear_messages(&self, _: &str) -> Result<()> {
        Ok(())
    }
}
