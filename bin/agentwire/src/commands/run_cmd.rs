use super::render;
use agentwire_agent::{Container, SystemBus};
use agentwire_core::{kind, AgentDefinition, Config, Event, EventLayer, Paths};
use agentwire_storage::open_repository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Run one agent in-process, send it `message` and print the turn.
pub async fn run(definition: String, message: String, commit: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let repository = open_repository(&config, &paths);
    let container = Container::new(SystemBus::new(), repository);
    container.load().await?;

    let image = match container.find_definition(&definition).await {
        Ok(existing) => container.register_definition(existing)?,
        Err(_) => container.register_definition(AgentDefinition::new(&definition))?,
    };
    let agent = container.run_image(&image.id).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let agent_id = agent.agent_id.clone();
    let subscription = container.bus().create_consumer().consume_where(
        move |e: &Event| {
            e.belongs_to(&agent_id)
                && (e.is(kind::TEXT_DELTA)
                    || e.is(kind::TURN_RESPONSE)
                    || e.layer() == EventLayer::Message
                    || e.layer() == EventLayer::Error)
        },
        move |e: &Event| {
            let _ = tx.send(e.clone());
        },
    )?;

    container.send_message(&agent.agent_id, &message).await?;

    let finished = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(event) = rx.recv().await {
            if render(&event, false) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    subscription.unsubscribe();

    if !finished {
        eprintln!("⏱  Turn did not finish");
    } else if commit {
        let derived = container.commit_session(&agent.agent_id).await?;
        println!("✓ Committed session as image {}", derived.id);
    }

    container.shutdown().await;
    Ok(())
}
