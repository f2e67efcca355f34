pub mod config_cmd;
pub mod connect;
pub mod run_cmd;
pub mod serve;

use agentwire_core::{kind, ErrorEvent, Event, MessageEvent, StreamEvent};
use std::io::Write;

/// Print `event` the way a terminal user wants to read a turn. Returns true
/// once the turn is over.
pub(crate) fn render(event: &Event, raw: bool) -> bool {
    if raw {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    } else if let Some(StreamEvent::TextDelta { text }) = event.decode::<StreamEvent>() {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    } else if let Some(MessageEvent::AssistantMessage { .. }) = event.decode::<MessageEvent>() {
        println!();
    } else if let Some(error) = event.decode::<ErrorEvent>() {
        eprintln!("❌ [{}] {}", error.code, error.message);
    }
    event.is(kind::TURN_RESPONSE)
}
