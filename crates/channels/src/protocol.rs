//! Frames exchanged over a WebSocket channel.
//!
//! Every text frame is one JSON `WireFrame`. An `event` frame carrying a
//! `msgId` asks the peer to answer with an `ack` frame for the same id.

use agentwire_core::{Event, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireFrame {
    Event {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<String>,
        event: Event,
    },
    Ack {
        msg_id: String,
    },
}

impl WireFrame {
    pub fn event(event: Event) -> Self {
        WireFrame::Event {
            msg_id: None,
            event,
        }
    }

    pub fn reliable(event: Event, msg_id: String) -> Self {
        WireFrame::Event {
            msg_id: Some(msg_id),
            event,
        }
    }

    pub fn ack(msg_id: &str) -> Self {
        WireFrame::Ack {
            msg_id: msg_id.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
