//! WebSocket channel server built on axum.

use crate::ack::AckOptions;
use crate::channel::{Channel, ChannelCore, ConnectionState};
use agentwire_core::{
    ConnectionEvent, Error, Event, Listener, ListenerSet, Result, ServerConfig, Subscription,
    TransportConfig,
};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::Listening => write!(f, "listening"),
        }
    }
}

/// Accepts inbound peers and yields one [`Channel`] per peer.
#[async_trait]
pub trait ChannelServer: Send + Sync {
    fn state(&self) -> ServerState;

    /// `stopped -> starting -> listening`. Fails with `Error::IllegalState`
    /// when not stopped.
    async fn listen(&self) -> Result<()>;

    /// Disconnect every tracked channel and stop. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Called exactly once for every accepted peer.
    fn on_connection(&self, handler: Listener<Arc<dyn Channel>>) -> Subscription;

    /// Live channels, in accept order.
    fn channels(&self) -> Vec<Arc<dyn Channel>>;
}

/// Server-side end of one peer connection. Born connected; once it
/// disconnects it cannot be reconnected.
pub struct ServerChannel {
    core: ChannelCore,
    shutdown: CancellationToken,
    peer: Option<SocketAddr>,
}

impl ServerChannel {
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn close_with(&self, reason: &str) {
        self.shutdown.cancel();
        self.core.detach();
        if self.core.set_state(ConnectionState::Disconnected) {
            self.core.acks().dispose();
            self.core.emit_connection(ConnectionEvent::Disconnected {
                channel_id: self.core.id().to_string(),
                reason: Some(reason.to_string()),
            });
        }
    }
}

#[async_trait]
impl Channel for ServerChannel {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    async fn connect(&self) -> Result<()> {
        Err(Error::Connection(format!(
            "server channel {} is {} and cannot be connected from this side",
            self.core.id(),
            self.core.state()
        )))
    }

    async fn disconnect(&self) -> Result<()> {
        self.close_with("server disconnect");
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<()> {
        self.core.send(event).await
    }

    async fn send_with_ack(&self, event: &Event, options: AckOptions) -> Result<()> {
        self.core.send_with_ack(event, options).await
    }

    fn on(&self, handler: Listener<Event>) -> Subscription {
        self.core.on(handler)
    }

    fn on_state_change(&self, handler: Listener<ConnectionState>) -> Subscription {
        self.core.on_state_change(handler)
    }
}

struct ServerInner {
    config: ServerConfig,
    transport: TransportConfig,
    state: Mutex<ServerState>,
    channels: Mutex<Vec<Arc<ServerChannel>>>,
    connection_listeners: ListenerSet<Arc<dyn Channel>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct WebSocketChannelServer {
    inner: Arc<ServerInner>,
}

impl WebSocketChannelServer {
    pub fn new(config: ServerConfig, transport: TransportConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                transport,
                state: Mutex::new(ServerState::Stopped),
                channels: Mutex::new(Vec::new()),
                connection_listeners: ListenerSet::new(),
                local_addr: Mutex::new(None),
                shutdown: Mutex::new(None),
                task: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bound address once listening (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// `ws://` URL clients should connect to, once listening.
    pub fn ws_url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("ws://{}{}", addr, self.inner.config.path))
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.config.path, get(handle_upgrade))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.inner.clone())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    channels: usize,
}

async fn handle_health(State(inner): State<Arc<ServerInner>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        channels: inner.channels.lock().len(),
    })
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(inner): State<Arc<ServerInner>>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(inner, socket, peer))
}

async fn serve_socket(inner: Arc<ServerInner>, socket: WebSocket, peer: SocketAddr) {
    if *inner.state.lock() != ServerState::Listening {
        debug!(peer = %peer, "Rejecting peer, server is not listening");
        return;
    }

    let id = format!("server-{}", inner.next_id.fetch_add(1, Ordering::SeqCst));
    let (tx, mut outbound) = mpsc::channel::<String>(inner.transport.outbound_buffer.max(1));
    let core = ChannelCore::new(id.clone(), ConnectionState::Connected);
    core.attach(tx);
    let channel = Arc::new(ServerChannel {
        core,
        shutdown: CancellationToken::new(),
        peer: Some(peer),
    });

    inner.channels.lock().push(channel.clone());
    info!(channel_id = %id, peer = %peer, "Peer connected");
    inner
        .connection_listeners
        .emit(&(channel.clone() as Arc<dyn Channel>));

    let (mut sink, mut stream) = socket.split();
    let reason = loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some((ack, event)) = channel.core.receive(&text) {
                        if let Some(ack) = ack {
                            if let Err(e) = sink.send(WsMessage::Text(ack)).await {
                                break format!("ack write failed: {}", e);
                            }
                        }
                        channel.core.dispatch(&event);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break "peer closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        break format!("write failed: {}", e);
                    }
                }
                None => break "channel dropped".to_string(),
            },
            _ = channel.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break "server disconnect".to_string();
            }
        }
    };

    channel.close_with(&reason);
    inner.channels.lock().retain(|c| c.core.id() != id);
    info!(channel_id = %id, reason = %reason, "Peer disconnected");
}

#[async_trait]
impl ChannelServer for WebSocketChannelServer {
    fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    async fn listen(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != ServerState::Stopped {
                return Err(Error::IllegalState(format!("server is already {}", *state)));
            }
            *state = ServerState::Starting;
        }

        let bind_addr = self.inner.config.bind_addr();
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.inner.state.lock() = ServerState::Stopped;
                return Err(Error::Connection(format!("failed to bind {}: {}", bind_addr, e)));
            }
        };
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local_addr);

        let shutdown = CancellationToken::new();
        *self.inner.shutdown.lock() = Some(shutdown.clone());
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                warn!(error = %e, "Channel server stopped with error");
            }
        });
        *self.inner.task.lock() = Some(handle);
        *self.inner.state.lock() = ServerState::Listening;
        info!(addr = %local_addr, path = %self.inner.config.path, "Channel server listening");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if *self.inner.state.lock() == ServerState::Stopped {
            return Ok(());
        }

        let channels: Vec<Arc<ServerChannel>> = std::mem::take(&mut *self.inner.channels.lock());
        for channel in &channels {
            channel.close_with("server closing");
        }

        if let Some(shutdown) = self.inner.shutdown.lock().take() {
            shutdown.cancel();
        }
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.local_addr.lock().take();
        *self.inner.state.lock() = ServerState::Stopped;
        info!(closed = channels.len(), "Channel server stopped");
        Ok(())
    }

    fn on_connection(&self, handler: Listener<Arc<dyn Channel>>) -> Subscription {
        self.inner
            .connection_listeners
            .add(move |channel| handler(channel))
    }

    fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.inner
            .channels
            .lock()
            .iter()
            .map(|c| c.clone() as Arc<dyn Channel>)
            .collect()
    }
}
