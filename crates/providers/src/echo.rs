use crate::driver::{Driver, DriverRequest, DriverStream};
use agentwire_core::{Error, Result, StreamEvent, TokenUsage};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Deterministic driver that answers `"Echo: <content>"`, one word per
/// `text_delta`. Used by the CLI demo and throughout the tests.
pub struct EchoDriver {
    delay: Duration,
    fail_after: Option<(usize, String)>,
    abort_generation: Arc<AtomicU64>,
    destroyed: AtomicBool,
}

impl Default for EchoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoDriver {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_after: None,
            abort_generation: Arc::new(AtomicU64::new(0)),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Pause before yielding each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Yield `events` events, then fail the stream with `message`.
    pub fn failing_after(mut self, events: usize, message: &str) -> Self {
        self.fail_after = Some((events, message.to_string()));
        self
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn script(request: &DriverRequest) -> Vec<StreamEvent> {
        let reply = format!("Echo: {}", request.content);
        let mut events = vec![StreamEvent::MessageStart {
            message_id: uuid::Uuid::new_v4().to_string(),
            model: request.model.clone().or_else(|| Some("echo".to_string())),
        }];
        let mut chunks = 0u64;
        for chunk in reply.split_inclusive(' ') {
            chunks += 1;
            events.push(StreamEvent::TextDelta {
                text: chunk.to_string(),
            });
        }
        events.push(StreamEvent::MessageStop {
            stop_reason: Some("end_turn".to_string()),
            usage: Some(TokenUsage::new(
                request.content.split_whitespace().count() as u64,
                chunks,
            )),
        });
        events
    }
}

#[async_trait]
impl Driver for EchoDriver {
    fn name(&self) -> &str {
        "echo"
    }

    async fn send_message(&self, request: DriverRequest) -> Result<DriverStream> {
        if self.is_destroyed() {
            return Err(Error::Driver("echo driver destroyed".to_string()));
        }
        debug!(
            agent_id = %request.agent_id,
            message_id = %request.message_id,
            history = request.history.len(),
            "Echo driver streaming reply"
        );

        let mut items: Vec<Result<StreamEvent>> =
            Self::script(&request).into_iter().map(Ok).collect();
        if let Some((after, message)) = &self.fail_after {
            items.truncate(*after);
            items.push(Err(Error::Driver(message.clone())));
        }

        let delay = self.delay;
        let generation = self.abort_generation.clone();
        let started = generation.load(Ordering::SeqCst);

        let stream = stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .take_while(move |_| {
                futures::future::ready(generation.load(Ordering::SeqCst) == started)
            });
        Ok(stream.boxed())
    }

    fn abort(&self) {
        self.abort_generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy(&self) {
        self.abort();
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(driver: &EchoDriver, content: &str) -> Vec<Result<StreamEvent>> {
        driver
            .send_message(DriverRequest::new("a1", "m1", content))
            .await
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_deltas_concatenate_to_reply() {
        let events = collect(&EchoDriver::new(), "hi there").await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                Ok(StreamEvent::TextDelta { text }) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Echo: hi there");
        assert!(matches!(events[0], Ok(StreamEvent::MessageStart { .. })));
        assert!(matches!(
            events.last(),
            Some(Ok(StreamEvent::MessageStop { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failing_after() {
        let driver = EchoDriver::new().failing_after(2, "boom");
        let events = collect(&driver, "hi").await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], Err(Error::Driver(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn test_abort_ends_stream() {
        let driver = EchoDriver::new().with_delay(Duration::from_millis(5));
        let mut stream = driver
            .send_message(DriverRequest::new("a1", "m1", "one two three"))
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        driver.abort();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_destroyed_driver_rejects() {
        let driver = EchoDriver::new();
        driver.destroy().await;
        assert!(driver.is_destroyed());
        assert!(driver
            .send_message(DriverRequest::new("a1", "m1", "hi"))
            .await
            .is_err());
    }
}
