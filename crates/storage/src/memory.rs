use crate::repository::Repository;
use agentwire_core::{AgentDefinition, AgentImage, MessageRecord, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local repository. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRepository {
    images: RwLock<HashMap<String, AgentImage>>,
    definitions: RwLock<HashMap<String, AgentDefinition>>,
    messages: RwLock<HashMap<String, Vec<MessageRecord>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_image(&self, image: &AgentImage) -> Result<()> {
        self.images
            .write()
            .await
            .insert(image.id.clone(), image.clone());
        Ok(())
    }

    async fn find_image_by_id(&self, image_id: &str) -> Result<Option<AgentImage>> {
        Ok(self.images.read().await.get(image_id).cloned())
    }

    async fn find_all_images(&self) -> Result<Vec<AgentImage>> {
        let mut images: Vec<AgentImage> = self.images.read().await.values().cloned().collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        self.images.write().await.remove(image_id);
        Ok(())
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        Ok(self.images.read().await.contains_key(image_id))
    }

    async fn save_definition(&self, definition: &AgentDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn find_definition_by_name(&self, name: &str) -> Result<Option<AgentDefinition>> {
        Ok(self.definitions.read().await.get(name).cloned())
    }

    async fn find_all_definitions(&self) -> Result<Vec<AgentDefinition>> {
        let mut defs: Vec<AgentDefinition> =
            self.definitions.read().await.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_definition(&self, name: &str) -> Result<()> {
        self.definitions.write().await.remove(name);
        Ok(())
    }

    async fn definition_exists(&self, name: &str) -> Result<bool> {
        Ok(self.definitions.read().await.contains_key(name))
    }

    async fn add_message(&self, session_id: &str, message: &MessageRecord) -> Result<()> {
        self.messages
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        Ok(self
            .messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.messages.write().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_core::MessageEvent;

    #[tokio::test]
    async fn test_image_crud() {
        let repo = MemoryRepository::new();
        let image = AgentImage::meta(&AgentDefinition::new("Echo"));
        assert!(!repo.image_exists("meta:Echo").await.unwrap());

        repo.save_image(&image).await.unwrap();
        assert!(repo.image_exists("meta:Echo").await.unwrap());
        assert_eq!(repo.find_image_by_id("meta:Echo").await.unwrap(), Some(image));
        assert_eq!(repo.find_all_images().await.unwrap().len(), 1);

        repo.delete_image("meta:Echo").await.unwrap();
        repo.delete_image("meta:Echo").await.unwrap();
        assert!(repo.find_image_by_id("meta:Echo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_definitions_sorted_by_name() {
        let repo = MemoryRepository::new();
        repo.save_definition(&AgentDefinition::new("Zed")).await.unwrap();
        repo.save_definition(&AgentDefinition::new("Alpha")).await.unwrap();
        let names: Vec<String> = repo
            .find_all_definitions()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Zed"]);
        assert!(repo.definition_exists("Zed").await.unwrap());
        repo.delete_definition("Zed").await.unwrap();
        assert!(!repo.definition_exists("Zed").await.unwrap());
    }

    #[tokio::test]
    async fn test_messages_keyed_by_session() {
        let repo = MemoryRepository::new();
        let first = MessageRecord::from_event(&MessageEvent::user("one"), 1);
        let second = MessageRecord::from_event(&MessageEvent::user("two"), 2);
        repo.add_message("s1", &first).await.unwrap();
        repo.add_message("s1", &second).await.unwrap();
        repo.add_message("s2", &first).await.unwrap();

        let s1 = repo.get_messages("s1").await.unwrap();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[1].text(), "two");

        repo.clear_messages("s1").await.unwrap();
        assert!(repo.get_messages("s1").await.unwrap().is_empty());
        assert_eq!(repo.get_messages("s2").await.unwrap().len(), 1);
    }
}
