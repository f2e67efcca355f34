//! WebSocket client channel with acknowledgments and bounded reconnection.

use crate::ack::AckOptions;
use crate::channel::{Channel, ChannelCore, ConnectionState};
use agentwire_core::{
    ConnectionEvent, Error, Event, Listener, Result, Subscription, TransportConfig,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connected socket stopped being pumped.
enum SocketEnd {
    /// `disconnect()` or the channel itself went away.
    Requested,
    Lost(String),
}

struct ClientInner {
    core: ChannelCore,
    url: String,
    transport: TransportConfig,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of a WebSocket channel.
///
/// After an unexpected close the channel enters `Reconnecting` and retries
/// up to `transport.max_reconnect_attempts` times with exponential backoff,
/// surfacing each attempt as a `reconnecting` event on `on` listeners.
#[derive(Clone)]
pub struct WebSocketChannel {
    inner: Arc<ClientInner>,
}

impl WebSocketChannel {
    pub fn new(url: &str, transport: TransportConfig) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid channel url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "channel url must use ws:// or wss://, got '{}'",
                url
            )));
        }
        Ok(Self {
            inner: Arc::new(ClientInner {
                core: ChannelCore::new(
                    format!("client-{}", uuid::Uuid::new_v4()),
                    ConnectionState::Disconnected,
                ),
                url: url.to_string(),
                transport,
                shutdown: Mutex::new(None),
                task: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.core.acks().pending()
    }
}

impl ClientInner {
    async fn open(&self) -> Result<Socket> {
        let attempt = connect_async(self.url.as_str());
        match tokio::time::timeout(self.transport.connect_timeout(), attempt).await {
            Ok(Ok((socket, _))) => Ok(socket),
            Ok(Err(e)) => Err(Error::Connection(format!(
                "failed to connect to {}: {}",
                self.url, e
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "connecting to {} took longer than {}ms",
                self.url, self.transport.connect_timeout_ms
            ))),
        }
    }

    fn mark_connected(&self) {
        self.core.set_state(ConnectionState::Connected);
        self.core.emit_connection(ConnectionEvent::Connected {
            channel_id: self.core.id().to_string(),
        });
    }

    fn mark_disconnected(&self, reason: &str) {
        self.core.detach();
        if self.core.set_state(ConnectionState::Disconnected) {
            self.core.emit_connection(ConnectionEvent::Disconnected {
                channel_id: self.core.id().to_string(),
                reason: Some(reason.to_string()),
            });
        }
    }

    /// Pump one socket until it closes or shutdown is requested.
    async fn pump(
        &self,
        socket: Socket,
        outbound: &mut mpsc::Receiver<String>,
        shutdown: &CancellationToken,
    ) -> SocketEnd {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some((ack, event)) = self.core.receive(&text) {
                            if let Some(ack) = ack {
                                if let Err(e) = sink.send(WsMessage::Text(ack)).await {
                                    return SocketEnd::Lost(format!("ack write failed: {}", e));
                                }
                            }
                            self.core.dispatch(&event);
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by peer".to_string());
                        return SocketEnd::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketEnd::Lost(e.to_string()),
                    None => return SocketEnd::Lost("stream ended".to_string()),
                },
                out = outbound.recv() => match out {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            return SocketEnd::Lost(format!("write failed: {}", e));
                        }
                    }
                    None => return SocketEnd::Requested,
                },
                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return SocketEnd::Requested;
                }
            }
        }
    }

    /// Drive the connection for its whole life, reconnecting on loss.
    async fn run(
        self: Arc<Self>,
        first: Socket,
        mut outbound: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) {
        let channel_id = self.core.id().to_string();
        let max_attempts = self.transport.max_reconnect_attempts;
        let mut socket = first;

        'session: loop {
            let reason = match self.pump(socket, &mut outbound, &shutdown).await {
                SocketEnd::Requested => return,
                SocketEnd::Lost(reason) => reason,
            };
            warn!(channel_id = %channel_id, reason = %reason, "Channel connection lost");

            if max_attempts == 0 {
                self.mark_disconnected(&reason);
                return;
            }
            self.core.set_state(ConnectionState::Reconnecting);

            for attempt in 1..=max_attempts {
                let delay = self.transport.reconnect_delay(attempt);
                self.core.emit_connection(ConnectionEvent::Reconnecting {
                    channel_id: channel_id.clone(),
                    attempt,
                    max_attempts,
                    delay_ms: delay.as_millis() as u64,
                });
                info!(
                    channel_id = %channel_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting channel"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }

                match self.open().await {
                    Ok(next) => {
                        if shutdown.is_cancelled() {
                            return;
                        }
                        info!(channel_id = %channel_id, attempt, "Channel reconnected");
                        self.mark_connected();
                        socket = next;
                        continue 'session;
                    }
                    Err(e) => {
                        warn!(channel_id = %channel_id, attempt, error = %e, "Reconnect attempt failed");
                    }
                }
            }

            warn!(channel_id = %channel_id, max_attempts, "Giving up on reconnection");
            self.mark_disconnected("reconnect attempts exhausted");
            return;
        }
    }
}

#[async_trait]
impl Channel for WebSocketChannel {
    fn id(&self) -> &str {
        self.inner.core.id()
    }

    fn state(&self) -> ConnectionState {
        self.inner.core.state()
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .core
            .transition(&[ConnectionState::Disconnected], ConnectionState::Connecting)
            .map_err(|current| {
                Error::Connection(format!(
                    "channel {} cannot connect while {}",
                    inner.core.id(),
                    current
                ))
            })?;

        // A previous session may still be winding down.
        if let Some(previous) = inner.task.lock().take() {
            previous.abort();
        }

        let socket = match inner.open().await {
            Ok(socket) => socket,
            Err(e) => {
                inner.core.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(inner.transport.outbound_buffer.max(1));
        let shutdown = CancellationToken::new();
        inner.core.attach(tx);
        *inner.shutdown.lock() = Some(shutdown.clone());

        info!(channel_id = %inner.core.id(), url = %inner.url, "Channel connected");
        inner.mark_connected();

        let handle = tokio::spawn(inner.clone().run(socket, rx, shutdown));
        *inner.task.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(shutdown) = inner.shutdown.lock().take() {
            shutdown.cancel();
        }
        let task = inner.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(inner.transport.connect_timeout(), task)
                .await
                .is_err()
            {
                debug!(channel_id = %inner.core.id(), "Channel task did not stop in time");
            }
        }
        inner.core.acks().dispose();
        inner.mark_disconnected("client disconnect");
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<()> {
        self.inner.core.send(event).await
    }

    async fn send_with_ack(&self, event: &Event, options: AckOptions) -> Result<()> {
        self.inner.core.send_with_ack(event, options).await
    }

    fn on(&self, handler: Listener<Event>) -> Subscription {
        self.inner.core.on(handler)
    }

    fn on_state_change(&self, handler: Listener<ConnectionState>) -> Subscription {
        self.inner.core.on_state_change(handler)
    }
}
