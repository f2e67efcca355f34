use serde::{Deserialize, Serialize};

use crate::event::MessageEvent;

/// Registered template describing an agent's static configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Driver used to run the agent (see `agentwire_providers::create_driver`).
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_driver() -> String {
    "echo".to_string()
}

impl AgentDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            system_prompt: None,
            driver: default_driver(),
            model: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_driver(mut self, driver: &str) -> Self {
        self.driver = driver.to_string();
        self
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(crate::Error::Validation(
                "definition name must not be empty".to_string(),
            ));
        }
        if name.contains(['/', '\\', ':']) {
            return Err(crate::Error::Validation(format!(
                "definition name '{}' must not contain '/', '\\' or ':'",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Genesis artifact created from a definition, always history-free.
    Meta,
    /// Frozen history produced by committing a session.
    Derived,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::Meta => write!(f, "meta"),
            ImageKind::Derived => write!(f, "derived"),
        }
    }
}

/// A runnable artifact. Running an image yields a fresh agent and session
/// seeded with `messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentImage {
    pub id: String,
    pub kind: ImageKind,
    pub definition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    pub created_at: i64,
}

impl AgentImage {
    pub fn meta_id(definition_name: &str) -> String {
        format!("meta:{}", definition_name)
    }

    pub fn meta(definition: &AgentDefinition) -> Self {
        Self {
            id: Self::meta_id(&definition.name),
            kind: ImageKind::Meta,
            definition_name: definition.name.clone(),
            parent_image_id: None,
            source_session_id: None,
            messages: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn derived(parent: &AgentImage, session_id: &str, messages: Vec<MessageRecord>) -> Self {
        Self {
            id: format!("derived:{}", uuid::Uuid::new_v4()),
            kind: ImageKind::Derived,
            definition_name: parent.definition_name.clone(),
            parent_image_id: Some(parent.id.clone()),
            source_session_id: Some(session_id.to_string()),
            messages,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

/// One persisted conversation record, the storage form of a message-layer event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub role: MessageRole,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: i64,
}

impl MessageRecord {
    pub fn from_event(message: &MessageEvent, timestamp: i64) -> Self {
        match message {
            MessageEvent::UserMessage { id, content } => Self {
                id: id.clone(),
                role: MessageRole::User,
                content: serde_json::Value::String(content.clone()),
                tool_call_id: None,
                name: None,
                is_error: false,
                timestamp,
            },
            MessageEvent::AssistantMessage { id, content, .. } => Self {
                id: id.clone(),
                role: MessageRole::Assistant,
                content: serde_json::Value::String(content.clone()),
                tool_call_id: None,
                name: None,
                is_error: false,
                timestamp,
            },
            MessageEvent::ToolCallMessage {
                id,
                tool_call_id,
                name,
                input,
            } => Self {
                id: id.clone(),
                role: MessageRole::ToolCall,
                content: input.clone(),
                tool_call_id: Some(tool_call_id.clone()),
                name: Some(name.clone()),
                is_error: false,
                timestamp,
            },
            MessageEvent::ToolResultMessage {
                id,
                tool_call_id,
                content,
                is_error,
            } => Self {
                id: id.clone(),
                role: MessageRole::ToolResult,
                content: content.clone(),
                tool_call_id: Some(tool_call_id.clone()),
                name: None,
                is_error: *is_error,
                timestamp,
            },
        }
    }

    /// Plain text of the record, empty for structured content.
    pub fn text(&self) -> &str {
        self.content.as_str().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_image_id() {
        let def = AgentDefinition::new("Echo");
        let image = AgentImage::meta(&def);
        assert_eq!(image.id, "meta:Echo");
        assert_eq!(image.kind, ImageKind::Meta);
        assert!(image.messages.is_empty());
        assert!(image.parent_image_id.is_none());
    }

    #[test]
    fn test_derived_image_links_parent() {
        let meta = AgentImage::meta(&AgentDefinition::new("Echo"));
        let record = MessageRecord::from_event(&MessageEvent::user("hi"), 1);
        let derived = AgentImage::derived(&meta, "sess-1", vec![record]);
        assert!(derived.id.starts_with("derived:"));
        assert_eq!(derived.parent_image_id.as_deref(), Some("meta:Echo"));
        assert_eq!(derived.source_session_id.as_deref(), Some("sess-1"));
        assert_eq!(derived.messages[0].text(), "hi");
    }

    #[test]
    fn test_definition_validation() {
        assert!(AgentDefinition::new("Echo").validate().is_ok());
        assert!(AgentDefinition::new("  ").validate().is_err());
        assert!(AgentDefinition::new("a:b").validate().is_err());
    }

    #[test]
    fn test_definition_defaults_from_json() {
        let def: AgentDefinition = serde_json::from_str(r#"{"name":"Echo"}"#).unwrap();
        assert_eq!(def.driver, "echo");
        assert!(def.system_prompt.is_none());
    }

    #[test]
    fn test_tool_result_record() {
        let msg = MessageEvent::ToolResultMessage {
            id: "m1".into(),
            tool_call_id: "call_1".into(),
            content: serde_json::json!({"ok": false}),
            is_error: true,
        };
        let record = MessageRecord::from_event(&msg, 42);
        assert_eq!(record.role, MessageRole::ToolResult);
        assert!(record.is_error);
        assert_eq!(record.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(record.text(), "");
    }
}
