use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub type AckCallback = Box<dyn FnOnce() + Send>;

/// Delivery options for one reliable send.
///
/// Exactly one of `on_ack` / `on_timeout` runs, unless the owning channel is
/// disposed first, in which case neither does.
pub struct AckOptions {
    pub timeout: Duration,
    pub on_ack: Option<AckCallback>,
    pub on_timeout: Option<AckCallback>,
}

impl AckOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            on_ack: None,
            on_timeout: None,
        }
    }

    pub fn on_ack(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_ack = Some(Box::new(callback));
        self
    }

    pub fn on_timeout(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for AckOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckOptions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct PendingAck {
    on_ack: Option<AckCallback>,
    timer: Option<JoinHandle<()>>,
}

/// Outstanding acknowledgments keyed by message id.
///
/// Whoever removes the entry from the map decides the outcome: the ack path
/// or the timer. The loser finds nothing and does nothing.
#[derive(Clone, Default)]
pub struct AckTracker {
    pending: Arc<Mutex<HashMap<String, PendingAck>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new message and arm its timer. Must be called from
    /// inside a tokio runtime.
    pub fn register(&self, options: AckOptions) -> String {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let AckOptions {
            timeout,
            on_ack,
            on_timeout,
        } = options;

        self.pending
            .lock()
            .insert(msg_id.clone(), PendingAck { on_ack, timer: None });

        let pending = self.pending.clone();
        let id = msg_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = pending.lock().remove(&id);
            if expired.is_some() {
                debug!(msg_id = %id, timeout_ms = timeout.as_millis() as u64, "Ack timed out");
                if let Some(callback) = on_timeout {
                    callback();
                }
            }
        });

        // A zero timeout may already have expired the entry.
        if let Some(entry) = self.pending.lock().get_mut(&msg_id) {
            entry.timer = Some(timer);
        }
        msg_id
    }

    /// Resolve `msg_id`. Returns false for unknown or already expired ids.
    pub fn acknowledge(&self, msg_id: &str) -> bool {
        let entry = self.pending.lock().remove(msg_id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                if let Some(callback) = entry.on_ack {
                    callback();
                }
                true
            }
            None => {
                debug!(msg_id, "Ignoring ack for unknown message");
                false
            }
        }
    }

    /// Forget `msg_id` without running either callback.
    pub fn cancel(&self, msg_id: &str) {
        if let Some(entry) = self.pending.lock().remove(msg_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Drop every pending entry and stop all timers.
    pub fn dispose(&self) {
        let drained: Vec<PendingAck> = self.pending.lock().drain().map(|(_, v)| v).collect();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
