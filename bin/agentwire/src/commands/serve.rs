use agentwire_agent::{ChannelLink, Container, SystemBus};
use agentwire_channels::{Channel, ChannelServer, WebSocketChannelServer};
use agentwire_core::{AgentDefinition, Config, Paths};
use agentwire_storage::open_repository;
use std::sync::Arc;
use tracing::{info, warn};

/// Start a container with one agent and serve it over WebSocket until Ctrl+C.
pub async fn run(host: Option<String>, port: Option<u16>, definition: String) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let repository = open_repository(&config, &paths);
    let container = Arc::new(Container::new(SystemBus::new(), repository));
    container.load().await?;

    let image = match container.find_definition(&definition).await {
        Ok(existing) => container.register_definition(existing)?,
        Err(_) => container.register_definition(AgentDefinition::new(&definition))?,
    };
    let agent = container.run_image(&image.id).await?;
    info!(agent_id = %agent.agent_id, image_id = %image.id, driver = %agent.driver, "Agent running");

    let server = WebSocketChannelServer::new(config.server.clone(), config.transport.clone());
    let bus = container.bus().clone();
    let agent_id = agent.agent_id.clone();
    let ack_timeout = config.transport.ack_timeout();
    server.on_connection(Arc::new(move |channel: &Arc<dyn Channel>| {
        match ChannelLink::open(&bus, channel.clone(), Some(&agent_id), Some(ack_timeout)) {
            Ok(link) => info!(channel_id = %link.channel_id(), "Client connected"),
            Err(e) => warn!(channel_id = %channel.id(), error = %e, "Failed to link client"),
        }
    }));
    server.listen().await?;

    let url = server
        .ws_url()
        .unwrap_or_else(|| config.server.ws_url());
    println!("🚀 Serving agent {} ({})", agent.agent_id, agent.definition_name);
    println!("   Listening on {}", url);
    println!("   Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    server.close().await?;
    container.shutdown().await;
    Ok(())
}
