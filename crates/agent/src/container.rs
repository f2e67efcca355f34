use crate::assembler::Assembler;
use crate::bridge::DriverBridge;
use crate::bus::SystemBus;
use crate::session::Session;
use agentwire_core::{
    AgentDefinition, AgentImage, Error, Event, MessageEvent, Result, StateEvent, Subscription,
};
use agentwire_providers::DriverRegistry;
use agentwire_storage::Repository;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A running agent as seen from outside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_id: String,
    pub session_id: String,
    pub image_id: String,
    pub definition_name: String,
    pub driver: String,
    pub created_at: DateTime<Utc>,
}

struct RunningAgent {
    info: AgentInfo,
    session: Arc<Session>,
    bridge: Arc<DriverBridge>,
    assembler: Subscription,
}

/// Registry of definitions, images and the agents running from them, all
/// sharing one bus.
///
/// Definitions and images are cached in memory and the cache answers reads.
/// Writes go to the repository in the background and failures are only
/// logged. Reads that miss the cache fall through to the repository.
pub struct Container {
    id: String,
    bus: SystemBus,
    repository: Arc<dyn Repository>,
    drivers: DriverRegistry,
    definitions: RwLock<HashMap<String, AgentDefinition>>,
    images: RwLock<HashMap<String, AgentImage>>,
    agents: Mutex<HashMap<String, RunningAgent>>,
}

impl Container {
    pub fn new(bus: SystemBus, repository: Arc<dyn Repository>) -> Self {
        Self {
            id: format!("container_{}", uuid::Uuid::new_v4().simple()),
            bus,
            repository,
            drivers: DriverRegistry::new(),
            definitions: RwLock::new(HashMap::new()),
            images: RwLock::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &SystemBus {
        &self.bus
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Warm the caches with everything the repository already holds.
    pub async fn load(&self) -> Result<()> {
        let definitions = self.repository.find_all_definitions().await?;
        let images = self.repository.find_all_images().await?;
        info!(
            container_id = %self.id,
            definitions = definitions.len(),
            images = images.len(),
            "Container loaded"
        );
        {
            let mut cache = self.definitions.write();
            for definition in definitions {
                cache.insert(definition.name.clone(), definition);
            }
        }
        let mut cache = self.images.write();
        for image in images {
            cache.insert(image.id.clone(), image);
        }
        Ok(())
    }

    fn persist<F>(&self, what: String, write: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let container_id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = write.await {
                        warn!(container_id = %container_id, what = %what, error = %e, "Background write failed");
                    }
                });
            }
            Err(_) => warn!(container_id = %container_id, what = %what, "No tokio runtime, write skipped"),
        }
    }

    /// Register `definition` and return its meta image. Registering the same
    /// name again replaces the definition and keeps the existing meta image.
    pub fn register_definition(&self, definition: AgentDefinition) -> Result<AgentImage> {
        definition.validate()?;
        self.definitions
            .write()
            .insert(definition.name.clone(), definition.clone());
        let repository = self.repository.clone();
        let saved = definition.clone();
        self.persist(format!("definition {}", definition.name), async move {
            repository.save_definition(&saved).await
        });

        let meta_id = AgentImage::meta_id(&definition.name);
        let image = {
            let mut images = self.images.write();
            if let Some(existing) = images.get(&meta_id) {
                return Ok(existing.clone());
            }
            let image = AgentImage::meta(&definition);
            images.insert(image.id.clone(), image.clone());
            image
        };

        let repository = self.repository.clone();
        let saved = image.clone();
        self.persist(format!("image {}", image.id), async move {
            repository.save_image(&saved).await
        });
        info!(container_id = %self.id, definition = %definition.name, image_id = %image.id, "Definition registered");
        Ok(image)
    }

    pub async fn find_definition(&self, name: &str) -> Result<AgentDefinition> {
        if let Some(definition) = self.definitions.read().get(name).cloned() {
            return Ok(definition);
        }
        let definition = self
            .repository
            .find_definition_by_name(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("definition {}", name)))?;
        self.definitions
            .write()
            .insert(definition.name.clone(), definition.clone());
        Ok(definition)
    }

    pub async fn find_image(&self, image_id: &str) -> Result<AgentImage> {
        if let Some(image) = self.images.read().get(image_id).cloned() {
            return Ok(image);
        }
        let image = self
            .repository
            .find_image_by_id(image_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("image {}", image_id)))?;
        self.images.write().insert(image.id.clone(), image.clone());
        Ok(image)
    }

    pub fn list_definitions(&self) -> Vec<AgentDefinition> {
        let mut definitions: Vec<AgentDefinition> = self.definitions.read().values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Cached images, oldest first.
    pub fn list_images(&self) -> Vec<AgentImage> {
        let mut images: Vec<AgentImage> = self.images.read().values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        images
    }

    fn stamp(&self, event: impl Into<Event>, agent_id: &str, session_id: &str) -> Event {
        event
            .into()
            .with_agent(agent_id)
            .with_session(session_id)
            .with_container(&self.id)
    }

    /// Start a fresh agent and session from `image_id`. The session starts
    /// with the image's message history.
    pub async fn run_image(&self, image_id: &str) -> Result<AgentInfo> {
        let image = self.find_image(image_id).await?;
        let definition = self.find_definition(&image.definition_name).await?;
        let driver = self.drivers.resolve(&definition)?;

        let agent_id = format!("agent_{}", uuid::Uuid::new_v4().simple());
        let session_id = uuid::Uuid::new_v4().to_string();
        self.bus.produce(self.stamp(StateEvent::AgentInitializing {}, &agent_id, &session_id));

        let session = Arc::new(Session::new(
            session_id.clone(),
            agent_id.clone(),
            image.id.clone(),
            self.repository.clone(),
        ));
        session.seed(image.messages.clone());
        session.attach(&self.bus)?;

        let assembler = Arc::new(Assembler::new(agent_id.clone()));
        let assembler_sub = match assembler.attach(&self.bus) {
            Ok(sub) => sub,
            Err(e) => {
                session.detach();
                return Err(e);
            }
        };

        let info = AgentInfo {
            agent_id: agent_id.clone(),
            session_id: session_id.clone(),
            image_id: image.id.clone(),
            definition_name: definition.name.clone(),
            driver: driver.name().to_string(),
            created_at: Utc::now(),
        };
        let bridge = Arc::new(
            DriverBridge::new(agent_id.clone(), driver)
                .with_session(session_id.clone())
                .with_definition(&definition)
                .with_history(session.clone()),
        );
        if let Err(e) = bridge.initialize(&self.bus) {
            assembler_sub.unsubscribe();
            session.detach();
            return Err(e);
        }

        self.agents.lock().await.insert(
            agent_id.clone(),
            RunningAgent {
                info: info.clone(),
                session,
                bridge,
                assembler: assembler_sub,
            },
        );
        self.bus.produce(self.stamp(StateEvent::AgentReady {}, &agent_id, &session_id));
        info!(
            container_id = %self.id,
            agent_id = %agent_id,
            image_id = %image.id,
            history = image.messages.len(),
            "Agent running"
        );
        Ok(info)
    }

    /// Produce a `user_message` for `agent_id` and return the event.
    pub async fn send_message(&self, agent_id: &str, content: &str) -> Result<Event> {
        let session_id = {
            let agents = self.agents.lock().await;
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
            agent.info.session_id.clone()
        };
        let event = self.stamp(MessageEvent::user(content), agent_id, &session_id);
        self.bus.produce(event.clone());
        Ok(event)
    }

    /// Cancel the agent's in-flight request. `Ok(false)` when it was idle.
    pub async fn interrupt(&self, agent_id: &str) -> Result<bool> {
        let agents = self.agents.lock().await;
        let agent = agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        Ok(agent.bridge.interrupt())
    }

    /// Freeze the agent's session into a derived image.
    pub async fn commit_session(&self, agent_id: &str) -> Result<AgentImage> {
        let session = {
            let agents = self.agents.lock().await;
            agents
                .get(agent_id)
                .map(|a| a.session.clone())
                .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?
        };
        let parent = self.find_image(session.image_id()).await?;
        let image = AgentImage::derived(&parent, session.id(), session.messages());
        self.images.write().insert(image.id.clone(), image.clone());

        let repository = self.repository.clone();
        let saved = image.clone();
        self.persist(format!("image {}", image.id), async move {
            repository.save_image(&saved).await
        });
        info!(
            container_id = %self.id,
            agent_id = %agent_id,
            image_id = %image.id,
            messages = image.messages.len(),
            "Session committed"
        );
        Ok(image)
    }

    pub async fn destroy_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self
            .agents
            .lock()
            .await
            .remove(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;
        agent.bridge.destroy().await;
        agent.assembler.unsubscribe();
        agent.session.detach();
        debug!(container_id = %self.id, agent_id = %agent_id, "Agent destroyed");
        Ok(())
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.agents.lock().await.get(agent_id).map(|a| a.info.clone())
    }

    pub async fn session(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.agents.lock().await.get(agent_id).map(|a| a.session.clone())
    }

    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .agents
            .lock()
            .await
            .values()
            .map(|a| a.info.clone())
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    /// Destroy every running agent. The bus stays open.
    pub async fn shutdown(&self) {
        let agents: Vec<RunningAgent> = self.agents.lock().await.drain().map(|(_, a)| a).collect();
        for agent in agents {
            agent.bridge.destroy().await;
            agent.assembler.unsubscribe();
            agent.session.detach();
        }
        info!(container_id = %self.id, "Container shut down");
    }
}
