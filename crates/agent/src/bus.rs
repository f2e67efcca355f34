//! In-process event bus.
//!
//! All producers funnel through a single dispatch point: `produce` appends to
//! a queue and whichever caller finds the bus idle drains it. Events are
//! therefore delivered to every consumer in call order, including events
//! produced from inside a handler (they are delivered after the current
//! event has reached every consumer).

use agentwire_core::{Error, Event, Result, Subscription};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Consumer {
    id: u64,
    active: AtomicBool,
    filter: Filter,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    consumers: Vec<Arc<Consumer>>,
    /// Each queued event carries the consumers registered when it was produced.
    queue: VecDeque<(Event, Vec<Arc<Consumer>>)>,
    dispatching: bool,
    closed: bool,
}

#[derive(Default)]
struct BusInner {
    state: Mutex<BusState>,
    next_id: AtomicU64,
}

/// Resets the dispatching flag if a handler panics mid-drain.
struct DrainGuard<'a> {
    inner: &'a BusInner,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.inner.state.lock();
            state.dispatching = false;
            state.queue.clear();
        }
    }
}

#[derive(Clone, Default)]
pub struct SystemBus {
    inner: Arc<BusInner>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `event`. After `close` this logs a warning and does nothing.
    pub fn produce(&self, event: Event) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                warn!(event_type = %event.event_type, uuid = %event.uuid, "produce on closed bus ignored");
                return;
            }
            let snapshot = state.consumers.clone();
            state.queue.push_back((event, snapshot));
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        let _guard = DrainGuard { inner: &self.inner };
        loop {
            let (event, consumers) = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    state.queue.clear();
                }
                match state.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            trace!(event_type = %event.event_type, consumers = consumers.len(), "dispatch");
            for consumer in consumers {
                if consumer.active.load(Ordering::SeqCst) && (consumer.filter)(&event) {
                    (consumer.handler)(&event);
                }
            }
        }
    }

    pub fn create_consumer(&self) -> BusConsumer {
        BusConsumer { bus: self.clone() }
    }

    /// Idempotent. Drops every consumer and any event not yet delivered.
    pub fn close(&self) {
        let removed = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
            std::mem::take(&mut state.consumers)
        };
        for consumer in removed {
            consumer.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    fn register(&self, filter: Filter, handler: Handler) -> Result<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(Consumer {
            id,
            active: AtomicBool::new(true),
            filter,
            handler,
        });
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::BusClosed);
            }
            state.consumers.push(consumer.clone());
        }

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            consumer.active.store(false, Ordering::SeqCst);
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().consumers.retain(|c| c.id != id);
            }
        }))
    }
}

/// Subscription factory for one bus. Every `consume*` call fails with
/// `Error::BusClosed` once the bus is closed.
#[derive(Clone)]
pub struct BusConsumer {
    bus: SystemBus,
}

impl BusConsumer {
    pub fn consume(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Result<Subscription> {
        self.bus.register(Box::new(|_: &Event| true), Box::new(handler))
    }

    pub fn consume_by_type(
        &self,
        event_type: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let wanted = event_type.to_string();
        self.bus
            .register(Box::new(move |e: &Event| e.event_type == wanted), Box::new(handler))
    }

    pub fn consume_by_types(
        &self,
        event_types: &[&str],
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let wanted: Vec<String> = event_types.iter().map(|t| t.to_string()).collect();
        self.bus.register(
            Box::new(move |e: &Event| wanted.iter().any(|t| *t == e.event_type)),
            Box::new(handler),
        )
    }

    pub fn consume_where(
        &self,
        filter: impl Fn(&Event) -> bool + Send + Sync + 'static,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.bus.register(Box::new(filter), Box::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentwire_core::{kind, MessageEvent, StreamEvent};
    use std::sync::atomic::AtomicUsize;

    fn delta(text: &str) -> Event {
        StreamEvent::TextDelta {
            text: text.to_string(),
        }
        .into()
    }

    fn recorder(bus: &SystemBus) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = bus
            .create_consumer()
            .consume(move |e| s.lock().push(e.event_type.clone()))
            .unwrap();
        (seen, sub)
    }

    #[test]
    fn test_delivery_in_call_order() {
        let bus = SystemBus::new();
        let texts = Arc::new(Mutex::new(Vec::new()));
        let t = texts.clone();
        bus.create_consumer()
            .consume(move |e| {
                if let Some(StreamEvent::TextDelta { text }) = e.decode() {
                    t.lock().push(text);
                }
            })
            .unwrap();

        for i in 0..50 {
            bus.produce(delta(&i.to_string()));
        }
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(*texts.lock(), expected);
    }

    #[test]
    fn test_reentrant_produce_keeps_global_order() {
        let bus = SystemBus::new();
        let producer = bus.clone();
        bus.create_consumer()
            .consume_by_type(kind::USER_MESSAGE, move |_| {
                producer.produce(delta("reply"));
            })
            .unwrap();
        let (seen, _sub) = recorder(&bus);

        bus.produce(MessageEvent::user("hi").into());
        bus.produce(delta("after"));
        // The reply was produced while user_message was in flight, so every
        // consumer sees user_message, then the reply, then "after".
        assert_eq!(
            *seen.lock(),
            vec![kind::USER_MESSAGE, kind::TEXT_DELTA, kind::TEXT_DELTA]
        );
    }

    #[test]
    fn test_filter_by_type() {
        let bus = SystemBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.create_consumer()
            .consume_by_type(kind::TEXT_DELTA, move |e| {
                assert!(e.is(kind::TEXT_DELTA));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        bus.produce(delta("a"));
        bus.produce(MessageEvent::user("x").into());
        bus.produce(Event::new("something_new", serde_json::json!({})));
        bus.produce(delta("b"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_consume_by_types() {
        let bus = SystemBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.create_consumer()
            .consume_by_types(&[kind::USER_MESSAGE, kind::MESSAGE_STOP], move |e| {
                s.lock().push(e.event_type.clone())
            })
            .unwrap();
        bus.produce(delta("a"));
        bus.produce(MessageEvent::user("x").into());
        bus.produce(
            StreamEvent::MessageStop {
                stop_reason: None,
                usage: None,
            }
            .into(),
        );
        assert_eq!(*seen.lock(), vec![kind::USER_MESSAGE, kind::MESSAGE_STOP]);
    }

    #[test]
    fn test_late_consumer_gets_no_replay() {
        let bus = SystemBus::new();
        bus.produce(delta("early"));
        let (seen, _sub) = recorder(&bus);
        assert!(seen.lock().is_empty());
        bus.produce(delta("late"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_consumer_added_during_dispatch_misses_current_event() {
        let bus = SystemBus::new();
        let inner_seen = Arc::new(AtomicUsize::new(0));
        let b = bus.clone();
        let i = inner_seen.clone();
        bus.create_consumer()
            .consume_by_type(kind::USER_MESSAGE, move |_| {
                let i = i.clone();
                b.create_consumer()
                    .consume(move |_| {
                        i.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        bus.produce(MessageEvent::user("x").into());
        assert_eq!(inner_seen.load(Ordering::SeqCst), 0);
        bus.produce(delta("y"));
        assert_eq!(inner_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let bus = SystemBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let (c, s) = (count.clone(), slot.clone());
        let sub = bus
            .create_consumer()
            .consume(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = s.lock().as_ref() {
                    sub.unsubscribe();
                    sub.unsubscribe();
                }
            })
            .unwrap();
        *slot.lock() = Some(sub);
        let (seen, _other) = recorder(&bus);

        bus.produce(delta("a"));
        bus.produce(delta("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(bus.consumer_count(), 1);
    }

    #[test]
    fn test_close_finality() {
        let bus = SystemBus::new();
        let (seen, _sub) = recorder(&bus);
        bus.close();
        bus.close();
        assert!(bus.is_closed());

        bus.produce(delta("ignored"));
        assert!(seen.lock().is_empty());
        assert!(matches!(
            bus.create_consumer().consume(|_| {}),
            Err(Error::BusClosed)
        ));
        assert!(bus
            .create_consumer()
            .consume_by_type(kind::TEXT_DELTA, |_| {})
            .is_err());
    }

    #[test]
    fn test_close_from_handler_drops_queued_events() {
        let bus = SystemBus::new();
        let b = bus.clone();
        bus.create_consumer()
            .consume_by_type(kind::USER_MESSAGE, move |_| {
                b.produce(delta("queued"));
                b.close();
            })
            .unwrap();
        let (seen, _sub) = recorder(&bus);

        // Closing stops delivery at once, even for the event in flight.
        bus.produce(MessageEvent::user("x").into());
        assert!(seen.lock().is_empty());
        assert_eq!(bus.consumer_count(), 0);
    }

    #[test]
    fn test_concurrent_producers_serialize() {
        let bus = SystemBus::new();
        let (seen, _sub) = recorder(&bus);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        bus.produce(delta("x"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().len(), 400);
    }
}
