pub mod config;
pub mod error;
pub mod event;
pub mod listener;
pub mod paths;
pub mod types;

pub use config::{Config, ServerConfig, StorageBackend, StorageConfig, TransportConfig};
pub use error::{Error, Result, DRIVER_ERROR};
pub use event::{
    kind, ConnectionEvent, ErrorEvent, Event, EventLayer, EventPayload, MessageEvent, StateEvent,
    StreamEvent, TokenUsage, TurnEvent,
};
pub use listener::{Listener, ListenerSet, Subscription};
pub use paths::Paths;
pub use types::{AgentDefinition, AgentImage, ImageKind, MessageRecord, MessageRole};
