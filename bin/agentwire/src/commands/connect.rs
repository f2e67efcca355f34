use super::render;
use agentwire_channels::{Channel, ConnectionState, WebSocketChannel};
use agentwire_core::{Config, Event, MessageEvent, Paths};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Connect to a running server, send one user message and print the turn.
pub async fn run(url: Option<String>, message: String, raw: bool, timeout: u64) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let url = url.unwrap_or_else(|| config.server.ws_url());

    let client = WebSocketChannel::new(&url, config.transport.clone())?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    client.on(Arc::new(move |event: &Event| {
        let _ = tx.send(event.clone());
    }));
    client.on_state_change(Arc::new(|state: &ConnectionState| {
        debug!(state = %state, "Connection state changed");
    }));

    client.connect().await?;
    client
        .send_reliable(&MessageEvent::user(message).into(), config.transport.ack_timeout())
        .await?;

    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                eprintln!("⏱  No response within {}s", timeout);
                break;
            }
            event = rx.recv() => match event {
                Some(event) => {
                    if render(&event, raw) {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    client.disconnect().await?;
    Ok(())
}
