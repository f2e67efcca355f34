use crate::repository::Repository;
use crate::session::MessageLog;
use agentwire_core::{AgentDefinition, AgentImage, Error, MessageRecord, Paths, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Repository backed by JSON files under a `Paths` base directory:
/// `images/<id>.json`, `definitions/<name>.json` and `sessions/<id>.jsonl`.
pub struct FileRepository {
    paths: Paths,
    log: MessageLog,
}

impl FileRepository {
    pub fn new(paths: Paths) -> Self {
        let log = MessageLog::new(paths.clone());
        Self { paths, log }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)
        .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
    Ok(Some(value))
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    entries.sort();

    let mut items = Vec::with_capacity(entries.len());
    for path in entries {
        match read_json::<T>(&path) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(items)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "Removed record");
    }
    Ok(())
}

#[async_trait]
impl Repository for FileRepository {
    async fn save_image(&self, image: &AgentImage) -> Result<()> {
        write_json(&self.paths.image_file(&image.id), image)
    }

    async fn find_image_by_id(&self, image_id: &str) -> Result<Option<AgentImage>> {
        read_json(&self.paths.image_file(image_id))
    }

    async fn find_all_images(&self) -> Result<Vec<AgentImage>> {
        let mut images: Vec<AgentImage> = read_dir_json(&self.paths.images_dir())?;
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(images)
    }

    async fn delete_image(&self, image_id: &str) -> Result<()> {
        remove_if_exists(&self.paths.image_file(image_id))
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        Ok(self.paths.image_file(image_id).exists())
    }

    async fn save_definition(&self, definition: &AgentDefinition) -> Result<()> {
        write_json(&self.paths.definition_file(&definition.name), definition)
    }

    async fn find_definition_by_name(&self, name: &str) -> Result<Option<AgentDefinition>> {
        read_json(&self.paths.definition_file(name))
    }

    async fn find_all_definitions(&self) -> Result<Vec<AgentDefinition>> {
        let mut defs: Vec<AgentDefinition> = read_dir_json(&self.paths.definitions_dir())?;
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn delete_definition(&self, name: &str) -> Result<()> {
        remove_if_exists(&self.paths.definition_file(name))
    }

    async fn definition_exists(&self, name: &str) -> Result<bool> {
        Ok(self.paths.definition_file(name).exists())
    }

    async fn add_message(&self, session_id: &str, message: &MessageRecord) -> Result<()> {
        self.log.append(session_id, message)
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        self.log.load(session_id)
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.log.clear(session_id)
    }
}
