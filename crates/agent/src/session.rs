use crate::bridge::HistorySource;
use crate::bus::SystemBus;
use agentwire_core::{Event, EventLayer, MessageEvent, MessageRecord, Result, Subscription};
use agentwire_storage::Repository;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Live message collector for one running agent.
///
/// The in-memory list is what reads see. Each record is also handed to a
/// background writer that appends it to the repository in order; write
/// failures are logged and do not affect the session.
pub struct Session {
    id: String,
    agent_id: String,
    image_id: String,
    messages: Mutex<Vec<MessageRecord>>,
    writer: Option<mpsc::UnboundedSender<MessageRecord>>,
    subscription: Mutex<Option<Subscription>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        image_id: impl Into<String>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        let id = id.into();
        let writer = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(write_behind(id.clone(), repository, rx));
                Some(tx)
            }
            Err(_) => {
                warn!(session_id = %id, "No tokio runtime, session messages will not be persisted");
                None
            }
        };
        Self {
            id,
            agent_id: agent_id.into(),
            image_id: image_id.into(),
            messages: Mutex::new(Vec::new()),
            writer,
            subscription: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The image this session was started from.
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Start with `records` (a derived image's history). They are persisted
    /// under this session like any other message.
    pub fn seed(&self, records: Vec<MessageRecord>) {
        for record in records {
            self.push(record);
        }
    }

    pub fn record(&self, message: &MessageEvent, timestamp: i64) {
        self.push(MessageRecord::from_event(message, timestamp));
    }

    fn push(&self, record: MessageRecord) {
        self.messages.lock().push(record.clone());
        if let Some(writer) = &self.writer {
            let _ = writer.send(record);
        }
    }

    /// Collect every message-layer event of this session's agent.
    pub fn attach(self: &Arc<Self>, bus: &SystemBus) -> Result<()> {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            return Ok(());
        }
        let agent_id = self.agent_id.clone();
        let session = Arc::downgrade(self);
        let subscription = bus.create_consumer().consume_where(
            move |e: &Event| e.layer() == EventLayer::Message && e.belongs_to(&agent_id),
            move |e: &Event| {
                let Some(session) = session.upgrade() else {
                    return;
                };
                match e.decode::<MessageEvent>() {
                    Some(message) => session.record(&message, e.timestamp),
                    None => warn!(uuid = %e.uuid, event_type = %e.event_type, "Unreadable message event"),
                }
            },
        )?;
        *slot = Some(subscription);
        debug!(session_id = %self.id, agent_id = %self.agent_id, "Session attached");
        Ok(())
    }

    pub fn detach(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySource for Session {
    fn history(&self) -> Vec<MessageRecord> {
        self.messages()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn write_behind(
    session_id: String,
    repository: Arc<dyn Repository>,
    mut rx: mpsc::UnboundedReceiver<MessageRecord>,
) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = repository.add_message(&session_id, &record).await {
            warn!(session_id = %session_id, message_id = %record.id, error = %e, "Failed to persist message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for, BrokenRepository};
    use agentwire_core::{MessageRole, StreamEvent};
    use agentwire_storage::MemoryRepository;

    #[tokio::test]
    async fn test_collects_own_message_events() {
        let bus = SystemBus::new();
        let repo = Arc::new(MemoryRepository::new());
        let session = Arc::new(Session::new("s1", "a1", "meta:Echo", repo.clone()));
        session.attach(&bus).unwrap();
        session.attach(&bus).unwrap();

        bus.produce(Event::from(MessageEvent::user("hi")).with_agent("a1"));
        bus.produce(Event::from(MessageEvent::user("elsewhere")).with_agent("a2"));
        bus.produce(Event::from(StreamEvent::TextDelta { text: "x".into() }).with_agent("a1"));
        bus.produce(
            Event::from(MessageEvent::AssistantMessage {
                id: "m2".into(),
                content: "Echo: hi".into(),
                stop_reason: None,
            })
            .with_agent("a1"),
        );

        let records = session.messages();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, MessageRole::User);
        assert_eq!(records[1].text(), "Echo: hi");

        for _ in 0..100 {
            if repo.get_messages("s1").await.unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(repo.get_messages("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_stops_collecting() {
        let bus = SystemBus::new();
        let session = Arc::new(Session::new("s1", "a1", "meta:Echo", Arc::new(MemoryRepository::new())));
        session.seed(vec![MessageRecord::from_event(&MessageEvent::user("old"), 1)]);
        session.attach(&bus).unwrap();
        session.detach();
        bus.produce(Event::from(MessageEvent::user("new")).with_agent("a1"));
        assert_eq!(session.len(), 1);
        assert_eq!(session.history()[0].text(), "old");
    }

    #[tokio::test]
    async fn test_write_failures_do_not_affect_session() {
        let bus = SystemBus::new();
        let session = Arc::new(Session::new("s1", "a1", "meta:Echo", Arc::new(BrokenRepository)));
        session.attach(&bus).unwrap();
        bus.produce(Event::from(MessageEvent::user("hi")).with_agent("a1"));
        wait_for(|| session.len() == 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(session.messages()[0].text(), "hi");
    }
}
