use agentwire_core::Event;
use serde_json::Value;
use std::sync::Arc;

/// What one handler produced for one input.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HandlerOutput {
    #[default]
    None,
    One(Event),
    Many(Vec<Event>),
}

impl HandlerOutput {
    pub fn into_events(self) -> Vec<Event> {
        match self {
            HandlerOutput::None => Vec::new(),
            HandlerOutput::One(event) => vec![event],
            HandlerOutput::Many(events) => events,
        }
    }
}

impl From<Event> for HandlerOutput {
    fn from(event: Event) -> Self {
        HandlerOutput::One(event)
    }
}

impl From<Option<Event>> for HandlerOutput {
    fn from(event: Option<Event>) -> Self {
        event.map_or(HandlerOutput::None, HandlerOutput::One)
    }
}

impl From<Vec<Event>> for HandlerOutput {
    fn from(events: Vec<Event>) -> Self {
        HandlerOutput::Many(events)
    }
}

/// Turns one externally shaped message into bus events.
///
/// Handlers may keep state between calls (partial tool input, usage
/// totals), so `handle` takes `&self` and implementations use interior
/// mutability.
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, input: &Value) -> bool;

    fn handle(&self, input: &Value) -> HandlerOutput;
}

/// Ordered chain of responsibility. Unlike a first-match dispatcher, every
/// matching handler runs and the outputs are concatenated in chain order.
#[derive(Clone, Default)]
pub struct MessageHandlerChain {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl MessageHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler`. Insertion order is priority order; duplicates are kept.
    pub fn add_handler(&mut self, handler: Arc<dyn MessageHandler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn process(&self, input: &Value) -> Vec<Event> {
        self.handlers
            .iter()
            .filter(|h| h.can_handle(input))
            .flat_map(|h| h.handle(input).into_events())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}
