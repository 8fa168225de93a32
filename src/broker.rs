//! In-memory publish/subscribe fan-out keyed by channel.
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a slow
//! subscriber: when a queue is full the message is dropped for that
//! subscriber only, and the rest of the fan-out proceeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Queue capacity per subscriber.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// Payloads are shared between subscribers, not copied.
pub type Payload = Arc<str>;

struct Slot {
    id: u64,
    tx: mpsc::Sender<Payload>,
}

#[derive(Default)]
struct BrokerInner {
    channels: RwLock<HashMap<String, Vec<Slot>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to one broker instance.
#[derive(Clone, Default)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener on `channel`.
    pub fn subscribe(&self, channel: &str) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Slot { id, tx });

        debug!(channel, subscriber = id, "subscribed");

        Subscriber {
            id,
            channel: channel.to_string(),
            rx,
            broker: self.clone(),
        }
    }

    /// Removes a listener and closes its queue. Unknown ids are ignored.
    pub fn unsubscribe(&self, channel: &str, subscriber_id: u64) {
        let mut channels = self.inner.channels.write();
        let Some(slots) = channels.get_mut(channel) else {
            return;
        };
        if let Some(pos) = slots.iter().position(|s| s.id == subscriber_id) {
            slots.remove(pos);
            debug!(channel, subscriber = subscriber_id, "unsubscribed");
        }
        if slots.is_empty() {
            channels.remove(channel);
        }
    }

    /// Fans `payload` out to every current subscriber of `channel`.
    pub fn publish(&self, channel: &str, payload: impl Into<Payload>) -> PublishReport {
        let payload = payload.into();

        // Snapshot the senders so the lock is released before any send.
        let senders: Vec<(u64, mpsc::Sender<Payload>)> = {
            let channels = self.inner.channels.read();
            match channels.get(channel) {
                Some(slots) => slots.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => Vec::new(),
            }
        };

        let mut report = PublishReport::default();
        for (id, tx) in senders {
            match tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(channel, subscriber = id, "subscriber queue full, dropping event");
                    report.dropped += 1;
                }
                // Raced with unsubscribe.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        report
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }
}

/// One live listener. Dropping it unsubscribes.
pub struct Subscriber {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Payload>,
    broker: EventBroker,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload in publish order; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.channel, self.id);
    }
}
