//! Environments connect the bus to the world outside it.
//!
//! A [`Receptor`] perceives: it turns external input into bus events. An
//! [`Effector`] acts: it consumes bus events and performs a side effect such
//! as writing to a socket.

use crate::bus::SystemBus;
use crate::chain::MessageHandlerChain;
use agentwire_channels::{AckOptions, Channel, ConnectionState};
use agentwire_core::{Error, Event, EventLayer, Result, Subscription};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub trait Receptor: Send + Sync {
    type Input: ?Sized;

    /// Start feeding the bus. Allowed once per receptor.
    fn emit(&self, bus: &SystemBus) -> Result<()>;

    /// Translate one external unit into bus events and produce them before
    /// returning. Returns how many events were produced.
    fn feed(&self, input: &Self::Input) -> usize;
}

pub trait Effector: Send + Sync {
    /// Start reacting to bus events. Repeated calls are no-ops.
    fn subscribe(&self, bus: &SystemBus) -> Result<()>;

    /// Unsubscribe and release everything started by `subscribe`.
    fn dispose(&self);
}

const ECHO_GUARD_CAPACITY: usize = 4096;

/// Remembers the uuids of events that arrived from one peer so the matching
/// effector never sends them back to it. Oldest entries are evicted first.
#[derive(Clone)]
pub struct EchoGuard {
    inner: Arc<Mutex<EchoGuardInner>>,
}

struct EchoGuardInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for EchoGuard {
    fn default() -> Self {
        Self::with_capacity(ECHO_GUARD_CAPACITY)
    }
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EchoGuardInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    pub fn remember(&self, uuid: &str) {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(uuid.to_string()) {
            return;
        }
        inner.order.push_back(uuid.to_string());
        while inner.order.len() > inner.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.inner.lock().seen.contains(uuid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which event types an effector relays.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RelayFilter {
    #[default]
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl RelayFilter {
    pub fn only(types: &[&str]) -> Self {
        RelayFilter::Only(types.iter().map(|t| t.to_string()).collect())
    }

    pub fn except(types: &[&str]) -> Self {
        RelayFilter::Except(types.iter().map(|t| t.to_string()).collect())
    }

    pub fn allows(&self, event_type: &str) -> bool {
        match self {
            RelayFilter::All => true,
            RelayFilter::Only(types) => types.iter().any(|t| t == event_type),
            RelayFilter::Except(types) => !types.iter().any(|t| t == event_type),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel receptor
// ---------------------------------------------------------------------------

/// Produces every event received on a channel onto the bus.
#[derive(Clone)]
pub struct ChannelReceptor {
    channel: Arc<dyn Channel>,
    default_agent: Option<String>,
    guard: Option<EchoGuard>,
    state: Arc<Mutex<ReceptorState>>,
}

#[derive(Default)]
struct ReceptorState {
    bus: Option<SystemBus>,
    subscription: Option<Subscription>,
}

impl ChannelReceptor {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            default_agent: None,
            guard: None,
            state: Arc::new(Mutex::new(ReceptorState::default())),
        }
    }

    /// Stamp `agent_id` on inbound events that carry none.
    pub fn with_default_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.default_agent = Some(agent_id.into());
        self
    }

    /// Record inbound uuids so the peer's effector can skip them.
    pub fn with_echo_guard(mut self, guard: EchoGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    /// Stop listening to the channel. Events already produced stay produced.
    pub fn detach(&self) {
        let subscription = {
            let mut state = self.state.lock();
            state.bus = None;
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
    }
}

impl Receptor for ChannelReceptor {
    type Input = Event;

    fn emit(&self, bus: &SystemBus) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.bus.is_some() {
                return Err(Error::IllegalState(format!(
                    "receptor for channel {} is already emitting",
                    self.channel.id()
                )));
            }
            state.bus = Some(bus.clone());
        }

        let receptor = self.clone();
        let subscription = self.channel.on(Arc::new(move |event: &Event| {
            receptor.feed(event);
        }));
        self.state.lock().subscription = Some(subscription);
        debug!(channel_id = %self.channel.id(), "Channel receptor attached");
        Ok(())
    }

    fn feed(&self, input: &Event) -> usize {
        let Some(bus) = self.state.lock().bus.clone() else {
            return 0;
        };
        let mut event = input.clone();
        if event.agent_id.is_none() {
            event.agent_id = self.default_agent.clone();
        }
        if let Some(guard) = &self.guard {
            guard.remember(&event.uuid);
        }
        bus.produce(event);
        1
    }
}

// ---------------------------------------------------------------------------
// Channel effector
// ---------------------------------------------------------------------------

/// Sends bus events to a channel, one at a time in bus order.
///
/// Connection-layer events are never relayed; they describe the local
/// transport only.
#[derive(Clone)]
pub struct ChannelEffector {
    channel: Arc<dyn Channel>,
    filter: RelayFilter,
    agent: Option<String>,
    guard: Option<EchoGuard>,
    reliable: Option<Duration>,
    state: Arc<Mutex<EffectorState>>,
}

#[derive(Default)]
struct EffectorState {
    subscription: Option<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl ChannelEffector {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            filter: RelayFilter::All,
            agent: None,
            guard: None,
            reliable: None,
            state: Arc::new(Mutex::new(EffectorState::default())),
        }
    }

    pub fn with_filter(mut self, filter: RelayFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Relay only events belonging to `agent_id`.
    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent = Some(agent_id.into());
        self
    }

    pub fn with_echo_guard(mut self, guard: EchoGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Request an acknowledgment for every relayed event. Missing acks are
    /// logged, never retried.
    pub fn reliable(mut self, timeout: Duration) -> Self {
        self.reliable = Some(timeout);
        self
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscription.is_some()
    }

    fn relays(&self, event: &Event) -> bool {
        event.layer() != EventLayer::Connection
            && self.filter.allows(&event.event_type)
            && self.agent.as_deref().map_or(true, |id| event.belongs_to(id))
            && !self.guard.as_ref().is_some_and(|g| g.contains(&event.uuid))
    }

    async fn forward(self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            let channel = &self.channel;
            if channel.state() != ConnectionState::Connected {
                debug!(
                    channel_id = %channel.id(),
                    event_type = %event.event_type,
                    state = %channel.state(),
                    "Dropping event for channel that is not connected"
                );
                continue;
            }

            let result = match self.reliable {
                Some(timeout) => {
                    let channel_id = channel.id().to_string();
                    let uuid = event.uuid.clone();
                    let options = AckOptions::new(timeout).on_timeout(move || {
                        warn!(channel_id = %channel_id, uuid = %uuid, "Relayed event was not acknowledged");
                    });
                    channel.send_with_ack(&event, options).await
                }
                None => channel.send(&event).await,
            };
            if let Err(e) = result {
                warn!(channel_id = %channel.id(), error = %e, "Failed to relay event");
            }
        }
    }
}

impl Effector for ChannelEffector {
    fn subscribe(&self, bus: &SystemBus) -> Result<()> {
        let mut state = self.state.lock();
        if state.subscription.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::IllegalState("channel effector needs a tokio runtime".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let filter = self.clone();
        let subscription = bus.create_consumer().consume_where(
            move |e: &Event| filter.relays(e),
            move |e: &Event| {
                let _ = tx.send(e.clone());
            },
        )?;
        state.task = Some(runtime.spawn(self.clone().forward(rx)));
        state.subscription = Some(subscription);
        debug!(channel_id = %self.channel.id(), "Channel effector subscribed");
        Ok(())
    }

    fn dispose(&self) {
        let (subscription, task) = {
            let mut state = self.state.lock();
            (state.subscription.take(), state.task.take())
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// A receptor and effector relaying one channel in both directions, sharing
/// an echo guard. Closes itself when the channel disconnects.
#[derive(Clone)]
pub struct ChannelLink {
    receptor: ChannelReceptor,
    effector: ChannelEffector,
    watch: Arc<Mutex<Option<Subscription>>>,
}

impl ChannelLink {
    /// Wire `channel` into `bus`. With `agent_id`, inbound events without an
    /// agent are addressed to it and only its events are relayed back.
    pub fn open(
        bus: &SystemBus,
        channel: Arc<dyn Channel>,
        agent_id: Option<&str>,
        ack_timeout: Option<Duration>,
    ) -> Result<Self> {
        let guard = EchoGuard::new();
        let mut receptor = ChannelReceptor::new(channel.clone()).with_echo_guard(guard.clone());
        let mut effector = ChannelEffector::new(channel.clone()).with_echo_guard(guard);
        if let Some(agent_id) = agent_id {
            receptor = receptor.with_default_agent(agent_id);
            effector = effector.for_agent(agent_id);
        }
        if let Some(timeout) = ack_timeout {
            effector = effector.reliable(timeout);
        }

        effector.subscribe(bus)?;
        if let Err(e) = receptor.emit(bus) {
            effector.dispose();
            return Err(e);
        }

        let link = Self {
            receptor,
            effector,
            watch: Arc::new(Mutex::new(None)),
        };
        let on_close = link.clone();
        let watch = channel.on_state_change(Arc::new(move |state: &ConnectionState| {
            if *state == ConnectionState::Disconnected {
                on_close.close();
            }
        }));
        *link.watch.lock() = Some(watch);
        debug!(channel_id = %channel.id(), agent_id = ?agent_id, "Channel linked to bus");
        Ok(link)
    }

    pub fn channel_id(&self) -> &str {
        self.receptor.channel_id()
    }

    pub fn is_open(&self) -> bool {
        self.effector.is_subscribed()
    }

    /// Idempotent.
    pub fn close(&self) {
        self.receptor.detach();
        self.effector.dispose();
        if let Some(watch) = self.watch.lock().take() {
            watch.unsubscribe();
        }
    }
}

// ---------------------------------------------------------------------------
// SDK receptor
// ---------------------------------------------------------------------------

/// Feeds SDK-shaped JSON messages through a handler chain onto the bus,
/// stamped with the owning agent and session.
pub struct SdkReceptor {
    chain: MessageHandlerChain,
    agent_id: String,
    session_id: Option<String>,
    bus: Mutex<Option<SystemBus>>,
}

impl SdkReceptor {
    pub fn new(agent_id: impl Into<String>, chain: MessageHandlerChain) -> Self {
        Self {
            chain,
            agent_id: agent_id.into(),
            session_id: None,
            bus: Mutex::new(None),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Receptor for SdkReceptor {
    type Input = Value;

    fn emit(&self, bus: &SystemBus) -> Result<()> {
        let mut slot = self.bus.lock();
        if slot.is_some() {
            return Err(Error::IllegalState(format!(
                "SDK receptor for {} is already emitting",
                self.agent_id
            )));
        }
        *slot = Some(bus.clone());
        Ok(())
    }

    fn feed(&self, input: &Value) -> usize {
        let Some(bus) = self.bus.lock().clone() else {
            warn!(agent_id = %self.agent_id, "SDK message fed before emit, dropped");
            return 0;
        };
        let events = self.chain.process(input);
        let count = events.len();
        for mut event in events {
            event.agent_id = Some(self.agent_id.clone());
            if let Some(session_id) = &self.session_id {
                event.session_id = Some(session_id.clone());
            }
            bus.produce(event);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::StreamEventHandler;
    use crate::testing::{wait_for, RecordingChannel};
    use agentwire_core::{kind, ConnectionEvent, MessageEvent, StreamEvent};
    use serde_json::json;

    fn delta(text: &str) -> Event {
        StreamEvent::TextDelta {
            text: text.to_string(),
        }
        .into()
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

    #[test]
    fn test_echo_guard_evicts_oldest() {
        let guard = EchoGuard::with_capacity(2);
        guard.remember("a");
        guard.remember("b");
        guard.remember("a");
        guard.remember("c");
        assert!(!guard.contains("a"));
        assert!(guard.contains("b") && guard.contains("c"));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_relay_filter() {
        assert!(RelayFilter::All.allows("anything"));
        assert!(RelayFilter::only(&[kind::TEXT_DELTA]).allows(kind::TEXT_DELTA));
        assert!(!RelayFilter::only(&[kind::TEXT_DELTA]).allows(kind::USER_MESSAGE));
        assert!(!RelayFilter::except(&[kind::TEXT_DELTA]).allows(kind::TEXT_DELTA));
    }

    #[tokio::test]
    async fn test_receptor_produces_and_stamps_agent() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let channel = RecordingChannel::connected();
        let receptor = ChannelReceptor::new(channel.clone()).with_default_agent("agent_1");
        receptor.emit(&bus).unwrap();
        assert!(receptor.emit(&bus).is_err());

        channel.inject(MessageEvent::user("hi").into());
        channel.inject(delta("x").with_agent("other"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].belongs_to("agent_1"));
        assert!(seen[1].belongs_to("other"));
    }

    #[tokio::test]
    async fn test_receptor_detach_stops_feeding() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let channel = RecordingChannel::connected();
        let receptor = ChannelReceptor::new(channel.clone());
        receptor.emit(&bus).unwrap();
        receptor.detach();
        channel.inject(delta("late"));
        assert!(seen.lock().is_empty());
        assert_eq!(receptor.feed(&delta("direct")), 0);
    }

    #[tokio::test]
    async fn test_effector_relays_in_order_and_skips_connection_events() {
        let bus = SystemBus::new();
        let channel = RecordingChannel::connected();
        let effector = ChannelEffector::new(channel.clone());
        effector.subscribe(&bus).unwrap();
        effector.subscribe(&bus).unwrap();
        assert_eq!(bus.consumer_count(), 1);

        bus.produce(delta("a"));
        bus.produce(
            ConnectionEvent::Connected {
                channel_id: "c".into(),
            }
            .into(),
        );
        bus.produce(delta("b"));

        wait_for(|| channel.sent.lock().len() == 2).await;
        let texts: Vec<String> = channel
            .sent
            .lock()
            .iter()
            .filter_map(|e| match e.decode::<StreamEvent>() {
                Some(StreamEvent::TextDelta { text }) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_echo_guard_prevents_bounce() {
        let bus = SystemBus::new();
        let channel = RecordingChannel::connected();
        let guard = EchoGuard::new();
        let receptor = ChannelReceptor::new(channel.clone()).with_echo_guard(guard.clone());
        let effector = ChannelEffector::new(channel.clone()).with_echo_guard(guard);
        receptor.emit(&bus).unwrap();
        effector.subscribe(&bus).unwrap();

        channel.inject(MessageEvent::user("from peer").into());
        bus.produce(delta("local"));

        wait_for(|| !channel.sent.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.sent_types(), vec![kind::TEXT_DELTA.to_string()]);
    }

    #[tokio::test]
    async fn test_effector_agent_scope_and_dispose() {
        let bus = SystemBus::new();
        let channel = RecordingChannel::connected();
        let effector = ChannelEffector::new(channel.clone())
            .for_agent("a1")
            .reliable(Duration::from_millis(100));
        effector.subscribe(&bus).unwrap();

        bus.produce(delta("mine").with_agent("a1"));
        bus.produce(delta("theirs").with_agent("a2"));
        wait_for(|| channel.sent.lock().len() == 1).await;

        effector.dispose();
        effector.dispose();
        assert!(!effector.is_subscribed());
        assert_eq!(bus.consumer_count(), 0);
        bus.produce(delta("after").with_agent("a1"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[test]
    fn test_sdk_receptor_stamps_ids() {
        let bus = SystemBus::new();
        let (seen, _sub) = capture(&bus);
        let receptor = SdkReceptor::new(
            "agent_9",
            MessageHandlerChain::new().with_handler(StreamEventHandler::new()),
        )
        .with_session("sess");

        let raw = json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "yo"}}});
        assert_eq!(receptor.feed(&raw), 0);
        receptor.emit(&bus).unwrap();
        assert_eq!(receptor.feed(&raw), 1);

        let seen = seen.lock();
        assert!(seen[0].belongs_to("agent_9"));
        assert_eq!(seen[0].session_id.as_deref(), Some("sess"));
    }

    #[tokio::test]
    async fn test_link_closes_with_channel() {
        let bus = SystemBus::new();
        let channel = RecordingChannel::connected();
        let link = ChannelLink::open(&bus, channel.clone(), Some("a1"), None).unwrap();
        assert!(link.is_open());
        assert_eq!(bus.consumer_count(), 1);

        channel.inject(MessageEvent::user("hi").into());
        bus.produce(delta("reply").with_agent("a1"));
        wait_for(|| channel.sent.lock().len() == 1).await;
        assert_eq!(channel.sent_types(), vec![kind::TEXT_DELTA.to_string()]);

        channel.disconnect().await.unwrap();
        assert!(!link.is_open());
        assert_eq!(bus.consumer_count(), 0);
        link.close();
    }
}
