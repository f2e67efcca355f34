use crate::bus::SystemBus;
use crate::environment::Effector;
use agentwire_core::{
    kind, AgentDefinition, ErrorEvent, Event, MessageEvent, MessageRecord, Result, StreamEvent,
    Subscription, DRIVER_ERROR,
};
use agentwire_providers::{Driver, DriverRequest};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supplies the conversation so far when a request is built.
pub trait HistorySource: Send + Sync {
    fn history(&self) -> Vec<MessageRecord>;
}

/// Connects one agent's `user_message` events to a [`Driver`] and
/// republishes the driver's stream onto the bus.
///
/// Requests are served one at a time in arrival order. `interrupt` cancels
/// the request in flight and leaves queued ones alone; `dispose` and
/// `destroy` cancel everything.
pub struct DriverBridge {
    agent_id: String,
    session_id: Option<String>,
    driver: Arc<dyn Driver>,
    history: Option<Arc<dyn HistorySource>>,
    system_prompt: Option<String>,
    model: Option<String>,
    root: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
    state: Mutex<BridgeState>,
    destroyed: AtomicBool,
}

#[derive(Default)]
struct BridgeState {
    subscription: Option<Subscription>,
    worker: Option<JoinHandle<()>>,
}

struct Worker {
    agent_id: String,
    session_id: Option<String>,
    driver: Arc<dyn Driver>,
    history: Option<Arc<dyn HistorySource>>,
    system_prompt: Option<String>,
    model: Option<String>,
    root: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
    bus: SystemBus,
}

impl DriverBridge {
    pub fn new(agent_id: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: None,
            driver,
            history: None,
            system_prompt: None,
            model: None,
            root: CancellationToken::new(),
            current: Arc::new(Mutex::new(None)),
            state: Mutex::new(BridgeState::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = Some(history);
        self
    }

    /// Carry the definition's system prompt and model into every request.
    pub fn with_definition(mut self, definition: &AgentDefinition) -> Self {
        self.system_prompt = definition.system_prompt.clone();
        self.model = definition.model.clone();
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Subscribe to this agent's `user_message` events. Calling it again
    /// while subscribed does nothing.
    pub fn initialize(&self, bus: &SystemBus) -> Result<()> {
        let mut state = self.state.lock();
        if state.subscription.is_some() || self.root.is_cancelled() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let agent_id = self.agent_id.clone();
        let subscription = bus.create_consumer().consume_by_type(kind::USER_MESSAGE, move |e: &Event| {
            if e.belongs_to(&agent_id) {
                let _ = tx.send(e.clone());
            }
        })?;

        let worker = Worker {
            agent_id: self.agent_id.clone(),
            session_id: self.session_id.clone(),
            driver: self.driver.clone(),
            history: self.history.clone(),
            system_prompt: self.system_prompt.clone(),
            model: self.model.clone(),
            root: self.root.clone(),
            current: self.current.clone(),
            bus: bus.clone(),
        };
        state.worker = Some(tokio::spawn(worker.run(rx)));
        state.subscription = Some(subscription);
        info!(agent_id = %self.agent_id, driver = %self.driver.name(), "Driver bridge initialized");
        Ok(())
    }

    /// Cancel the request in flight, if any. The worker publishes an
    /// `interrupted` event once it has stopped. Returns whether a request
    /// was cancelled.
    pub fn interrupt(&self) -> bool {
        // The worker clears the slot before it reports or starts the next
        // request, so holding it keeps the abort from reaching a later one.
        let mut current = self.current.lock();
        let Some(token) = current.take() else {
            return false;
        };
        self.driver.abort();
        token.cancel();
        drop(current);
        debug!(agent_id = %self.agent_id, "Driver request interrupted");
        true
    }

    /// Cancel everything and release the bus subscription. Idempotent.
    pub fn dispose(&self) {
        self.root.cancel();
        self.driver.abort();
        let subscription = self.state.lock().subscription.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            debug!(agent_id = %self.agent_id, "Driver bridge disposed");
        }
    }

    /// `dispose`, then let the worker finish and destroy the driver once.
    pub async fn destroy(&self) {
        self.dispose();
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!(agent_id = %self.agent_id, error = %e, "Driver bridge worker failed");
                }
            }
        }
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.driver.destroy().await;
        }
    }
}

impl Effector for DriverBridge {
    fn subscribe(&self, bus: &SystemBus) -> Result<()> {
        self.initialize(bus)
    }

    fn dispose(&self) {
        DriverBridge::dispose(self);
    }
}

impl Drop for DriverBridge {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Event>) {
        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.serve(&trigger).await;
        }
        debug!(agent_id = %self.agent_id, "Driver bridge worker stopped");
    }

    fn request_for(&self, trigger: &Event) -> Option<DriverRequest> {
        let Some(MessageEvent::UserMessage { id, content }) = trigger.decode::<MessageEvent>() else {
            warn!(uuid = %trigger.uuid, "user_message without a readable payload");
            return None;
        };
        let history = self
            .history
            .as_ref()
            .map(|h| h.history().into_iter().filter(|r| r.id != id).collect())
            .unwrap_or_default();
        Some(DriverRequest {
            agent_id: self.agent_id.clone(),
            session_id: trigger.session_id.clone().or_else(|| self.session_id.clone()),
            message_id: id,
            content,
            history,
            system_prompt: self.system_prompt.clone(),
            model: self.model.clone(),
        })
    }

    async fn serve(&self, trigger: &Event) {
        let Some(request) = self.request_for(trigger) else {
            return;
        };
        let message_id = request.message_id.clone();
        let token = self.root.child_token();
        *self.current.lock() = Some(token.clone());

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.driver.send_message(request) => Some(opened),
        };

        let mut produced = 0usize;
        match opened {
            None => {}
            Some(Err(e)) => self.publish_error(trigger, &e),
            Some(Ok(mut stream)) => loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    None => break,
                    Some(Ok(event)) => {
                        if token.is_cancelled() {
                            break;
                        }
                        self.bus.produce(Event::from(event).correlated_with(trigger));
                        produced += 1;
                    }
                    Some(Err(e)) => {
                        self.publish_error(trigger, &e);
                        break;
                    }
                }
            },
        }

        // Requests run one at a time, so the slot holds this token or nothing.
        self.current.lock().take();

        if token.is_cancelled() && !self.root.is_cancelled() {
            self.bus.produce(
                Event::from(StreamEvent::Interrupted {
                    reason: Some("interrupted".to_string()),
                })
                .correlated_with(trigger),
            );
        }
        debug!(agent_id = %self.agent_id, message_id = %message_id, produced, "Driver request finished");
    }

    fn publish_error(&self, trigger: &Event, err: &agentwire_core::Error) {
        warn!(agent_id = %self.agent_id, error = %err, "Driver request failed");
        let mut event = ErrorEvent::new(DRIVER_ERROR, err.to_string(), true);
        if let Some(stack) = source_chain(err) {
            event = event.with_stack(stack);
        }
        self.bus.produce(Event::from(event).correlated_with(trigger));
    }
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut lines = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_for;
    use agentwire_core::{EventPayload, MessageRole};
    use agentwire_providers::{DriverStream, EchoDriver};
    use std::time::Duration;

    fn user(agent: &str, text: &str) -> Event {
        Event::from(MessageEvent::user(text)).with_agent(agent)
    }

    fn capture(bus: &SystemBus) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = bus
            .create_consumer()
            .consume(move |e: &Event| s.lock().push(e.clone()))
            .unwrap();
        (seen, sub)
    }

    fn deltas(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e.decode::<StreamEvent>() {
                Some(StreamEvent::TextDelta { text }) => Some(text),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_republishes_stream_for_own_agent_only() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let bridge = DriverBridge::new("a1", Arc::new(EchoDriver::new()));
        bridge.initialize(&bus).unwrap();
        bridge.initialize(&bus).unwrap();

        bus.produce(user("a2", "not mine"));
        bus.produce(user("a1", "hello there"));
        wait_for(|| seen.lock().iter().any(|e| e.is(kind::MESSAGE_STOP))).await;

        let seen = seen.lock();
        assert_eq!(deltas(&seen).concat(), "Echo: hello there");
        assert!(seen
            .iter()
            .filter(|e| e.layer() == agentwire_core::EventLayer::Stream)
            .all(|e| e.belongs_to("a1")));
        assert_eq!(seen.iter().filter(|e| e.is(kind::MESSAGE_START)).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_after_n_events_stops_republishing() {
        let bus = SystemBus::new();
        let bridge = Arc::new(DriverBridge::new(
            "a1",
            Arc::new(EchoDriver::new().with_delay(Duration::from_millis(2))),
        ));
        bridge.initialize(&bus).unwrap();

        let deltas_seen = Arc::new(Mutex::new(0usize));
        let count = deltas_seen.clone();
        let b = bridge.clone();
        let _sub = bus
            .create_consumer()
            .consume_by_type(kind::TEXT_DELTA, move |_e: &Event| {
                let mut n = count.lock();
                *n += 1;
                if *n == 2 {
                    assert!(b.interrupt());
                }
            })
            .unwrap();
        let (seen, _all) = capture(&bus);

        bus.produce(user("a1", "one two three four five six"));
        wait_for(|| seen.lock().iter().any(|e| e.is(kind::INTERRUPTED))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let seen = seen.lock();
        assert_eq!(*deltas_seen.lock(), 2);
        assert!(!seen.iter().any(|e| e.is(kind::MESSAGE_STOP)));
        assert!(seen.last().unwrap().is(kind::INTERRUPTED));
        assert!(!bridge.interrupt());
    }

    struct LoggingDriver {
        inner: EchoDriver,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Driver for LoggingDriver {
        fn name(&self) -> &str {
            "logging"
        }

        async fn send_message(&self, request: DriverRequest) -> Result<DriverStream> {
            self.log.lock().push(format!("send:{}", request.content));
            self.inner.send_message(request).await
        }

        fn abort(&self) {
            self.log.lock().push("abort".to_string());
            self.inner.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_does_not_abort_queued_request() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = LoggingDriver {
            inner: EchoDriver::new().with_delay(Duration::from_millis(5)),
            log: log.clone(),
        };
        let bridge = DriverBridge::new("a1", Arc::new(driver));
        bridge.initialize(&bus).unwrap();

        bus.produce(user("a1", "one two three four five six seven eight"));
        bus.produce(user("a1", "second"));
        wait_for(|| seen.lock().iter().any(|e| e.is(kind::TEXT_DELTA))).await;
        assert!(bridge.interrupt());
        wait_for(|| seen.lock().iter().any(|e| e.is(kind::MESSAGE_STOP))).await;

        assert_eq!(
            *log.lock(),
            vec![
                "send:one two three four five six seven eight".to_string(),
                "abort".to_string(),
                "send:second".to_string(),
            ]
        );
        let seen = seen.lock();
        let interrupted = seen.iter().position(|e| e.is(kind::INTERRUPTED)).unwrap();
        let second_start = seen.iter().rposition(|e| e.is(kind::MESSAGE_START)).unwrap();
        assert!(interrupted < second_start);
        assert_eq!(seen.iter().filter(|e| e.is(kind::MESSAGE_START)).count(), 2);
        assert_eq!(seen.iter().filter(|e| e.is(kind::MESSAGE_STOP)).count(), 1);
    }

    #[tokio::test]
    async fn test_driver_error_becomes_recoverable_error_event() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let bridge = DriverBridge::new("a1", Arc::new(EchoDriver::new().failing_after(2, "backend down")));
        bridge.initialize(&bus).unwrap();

        bus.produce(user("a1", "first"));
        bus.produce(user("a1", "second"));
        wait_for(|| seen.lock().iter().filter(|e| e.is(kind::ERROR)).count() == 2).await;

        let seen = seen.lock();
        let error = seen.iter().find(|e| e.is(kind::ERROR)).unwrap();
        let payload = ErrorEvent::from_parts(&error.event_type, &error.data).unwrap();
        assert_eq!(payload.code, DRIVER_ERROR);
        assert_eq!(payload.role, "error");
        assert_eq!(error.data["role"], "error");
        assert!(payload.recoverable);
        assert!(payload.message.contains("backend down"));
        assert!(error.belongs_to("a1"));
    }

    #[tokio::test]
    async fn test_requests_are_served_in_order() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let bridge = DriverBridge::new(
            "a1",
            Arc::new(EchoDriver::new().with_delay(Duration::from_millis(1))),
        );
        bridge.initialize(&bus).unwrap();

        bus.produce(user("a1", "first"));
        bus.produce(user("a1", "second"));
        wait_for(|| seen.lock().iter().filter(|e| e.is(kind::MESSAGE_STOP)).count() == 2).await;

        assert_eq!(deltas(&seen.lock()).concat(), "Echo: firstEcho: second");
    }

    #[test]
    fn test_history_excludes_current_message() {
        struct Fixed(Vec<MessageRecord>);
        impl HistorySource for Fixed {
            fn history(&self) -> Vec<MessageRecord> {
                self.0.clone()
            }
        }

        let trigger = MessageEvent::user("now");
        let earlier = MessageRecord::from_event(&MessageEvent::user("before"), 1);
        let current = MessageRecord::from_event(&trigger, 2);
        let worker = Worker {
            agent_id: "a1".into(),
            session_id: Some("s1".into()),
            driver: Arc::new(EchoDriver::new()),
            history: Some(Arc::new(Fixed(vec![earlier, current]))),
            system_prompt: Some("be brief".into()),
            model: None,
            root: CancellationToken::new(),
            current: Arc::new(Mutex::new(None)),
            bus: SystemBus::new(),
        };
        let request = worker.request_for(&Event::from(trigger).with_agent("a1")).unwrap();
        assert_eq!(request.content, "now");
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.history[0].role, MessageRole::User);
        assert_eq!(request.session_id.as_deref(), Some("s1"));
        assert_eq!(request.system_prompt.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_safe_when_idle() {
        let bus = SystemBus::new();
        let driver = Arc::new(EchoDriver::new());
        let bridge = DriverBridge::new("a1", driver.clone());
        bridge.destroy().await;

        bridge.initialize(&bus).unwrap();
        assert_eq!(bus.consumer_count(), 0);
        bridge.destroy().await;
        bridge.dispose();
        assert!(driver.is_destroyed());
        assert!(!bridge.interrupt());
    }

    #[tokio::test]
    async fn test_destroy_unsubscribes() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let bridge = DriverBridge::new("a1", Arc::new(EchoDriver::new()));
        bridge.initialize(&bus).unwrap();
        assert_eq!(bus.consumer_count(), 2);
        bridge.destroy().await;
        assert_eq!(bus.consumer_count(), 1);

        bus.produce(user("a1", "anyone?"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
