use agentwire_core::{AgentDefinition, AgentImage, MessageRecord, Result};
use async_trait::async_trait;

/// Durable home for definitions, images and per-session message logs.
///
/// Lookups return `Ok(None)` for absent keys; turning that into
/// `Error::NotFound` is the caller's decision. Deletes of absent keys succeed.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_image(&self, image: &AgentImage) -> Result<()>;
    async fn find_image_by_id(&self, image_id: &str) -> Result<Option<AgentImage>>;
    async fn find_all_images(&self) -> Result<Vec<AgentImage>>;
    async fn delete_image(&self, image_id: &str) -> Result<()>;
    async fn image_exists(&self, image_id: &str) -> Result<bool>;

    async fn save_definition(&self, definition: &AgentDefinition) -> Result<()>;
    async fn find_definition_by_name(&self, name: &str) -> Result<Option<AgentDefinition>>;
    async fn find_all_definitions(&self) -> Result<Vec<AgentDefinition>>;
    async fn delete_definition(&self, name: &str) -> Result<()>;
    async fn definition_exists(&self, name: &str) -> Result<bool>;

    async fn add_message(&self, session_id: &str, message: &MessageRecord) -> Result<()>;
    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>>;
    async fn clear_messages(&self, session_id: &str) -> Result<()>;
}
