use crate::ack::{AckOptions, AckTracker};
use crate::protocol::WireFrame;
use agentwire_core::{ConnectionEvent, Error, Event, Listener, ListenerSet, Result, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Connection state machine of a [`Channel`].
///
/// `Disconnected -> Connecting -> Connected`, `Connected -> Reconnecting ->
/// Connected` on transient loss, and back to `Disconnected` on explicit
/// disconnect or once reconnection gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Bidirectional event transport between two buses.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Fails with `Error::Connection` unless the channel is disconnected.
    async fn connect(&self) -> Result<()>;

    /// Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Fails with `Error::NotConnected` unless the channel is connected.
    async fn send(&self, event: &Event) -> Result<()>;

    /// Send and track an acknowledgment from the peer. The returned result
    /// only covers handing the frame to the transport; delivery is reported
    /// through `options`.
    async fn send_with_ack(&self, event: &Event, options: AckOptions) -> Result<()>;

    /// Inbound events, plus this channel's own connection events.
    fn on(&self, handler: Listener<Event>) -> Subscription;

    fn on_state_change(&self, handler: Listener<ConnectionState>) -> Subscription;

    /// Send and wait for the acknowledgment, failing with `Error::Timeout`.
    async fn send_reliable(&self, event: &Event, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel::<bool>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let on_ack = slot.clone();
        let on_timeout = slot;
        let options = AckOptions::new(timeout)
            .on_ack(move || {
                if let Some(tx) = on_ack.lock().take() {
                    let _ = tx.send(true);
                }
            })
            .on_timeout(move || {
                if let Some(tx) = on_timeout.lock().take() {
                    let _ = tx.send(false);
                }
            });

        self.send_with_ack(event, options).await?;
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Timeout(format!(
                "no ack for event {} within {}ms",
                event.uuid,
                timeout.as_millis()
            ))),
            Err(_) => Err(Error::Connection(format!(
                "channel {} closed before event {} was acknowledged",
                self.id(),
                event.uuid
            ))),
        }
    }
}

/// State, listeners and ack bookkeeping shared by the client and server
/// channel implementations.
pub(crate) struct ChannelCore {
    id: String,
    state: Mutex<ConnectionState>,
    events: ListenerSet<Event>,
    state_listeners: ListenerSet<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    acks: AckTracker,
}

impl ChannelCore {
    pub(crate) fn new(id: String, initial: ConnectionState) -> Self {
        Self {
            id,
            state: Mutex::new(initial),
            events: ListenerSet::new(),
            state_listeners: ListenerSet::new(),
            outbound: Mutex::new(None),
            acks: AckTracker::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns true when the state actually changed.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = next;
            previous
        };
        if previous == next {
            return false;
        }
        debug!(channel_id = %self.id, from = %previous, to = %next, "Channel state changed");
        self.state_listeners.emit(&next);
        true
    }

    /// Move to `next` only if the current state is one of `from`.
    pub(crate) fn transition(
        &self,
        from: &[ConnectionState],
        next: ConnectionState,
    ) -> std::result::Result<(), ConnectionState> {
        {
            let mut state = self.state.lock();
            if !from.contains(&*state) {
                return Err(*state);
            }
            *state = next;
        }
        debug!(channel_id = %self.id, to = %next, "Channel state changed");
        self.state_listeners.emit(&next);
        Ok(())
    }

    pub(crate) fn attach(&self, outbound: mpsc::Sender<String>) {
        *self.outbound.lock() = Some(outbound);
    }

    pub(crate) fn detach(&self) {
        self.outbound.lock().take();
    }

    pub(crate) fn emit_connection(&self, event: ConnectionEvent) {
        self.events.emit(&Event::from(event));
    }

    pub(crate) fn dispatch(&self, event: &Event) {
        self.events.emit(event);
    }

    pub(crate) fn acks(&self) -> &AckTracker {
        &self.acks
    }

    pub(crate) fn on(&self, handler: Listener<Event>) -> Subscription {
        self.events.add(move |event| handler(event))
    }

    pub(crate) fn on_state_change(&self, handler: Listener<ConnectionState>) -> Subscription {
        self.state_listeners.add(move |state| handler(state))
    }

    async fn push(&self, frame: WireFrame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected(format!(
                "channel {} is {}",
                self.id,
                self.state()
            )));
        }
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::NotConnected(format!("channel {} has no socket", self.id)))?;
        tx.send(frame.encode()?)
            .await
            .map_err(|_| Error::Connection(format!("channel {} writer stopped", self.id)))
    }

    pub(crate) async fn send(&self, event: &Event) -> Result<()> {
        self.push(WireFrame::event(event.clone())).await
    }

    pub(crate) async fn send_with_ack(&self, event: &Event, options: AckOptions) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected(format!(
                "channel {} is {}",
                self.id,
                self.state()
            )));
        }
        let msg_id = self.acks.register(options);
        let result = self
            .push(WireFrame::reliable(event.clone(), msg_id.clone()))
            .await;
        if result.is_err() {
            self.acks.cancel(&msg_id);
        }
        result
    }

    /// Decode one inbound text frame. Acks are resolved here; an event comes
    /// back with the ack frame (if any) the caller must write before
    /// dispatching it.
    pub(crate) fn receive(&self, text: &str) -> Option<(Option<String>, Event)> {
        match WireFrame::decode(text) {
            Ok(WireFrame::Ack { msg_id }) => {
                self.acks.acknowledge(&msg_id);
                None
            }
            Ok(WireFrame::Event { msg_id, event }) => {
                let ack = msg_id.and_then(|id| WireFrame::ack(&id).encode().ok());
                Some((ack, event))
            }
            Err(e) => {
                warn!(channel_id = %self.id, error = %e, "Dropping unreadable frame");
                None
            }
        }
    }
}
