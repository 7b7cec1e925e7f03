use std::collections::HashMap;
use std::sync::RwLock;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::debug;
use uuid::Uuid;

use crate::schedule::events::BatchEvent;

pub const DEFAULT_OBSERVER_BUFFER: usize = 64;

/// Receiving end of a hub registration. An observer may be subscribed to
/// any number of batches; events of one batch arrive in publish order.
///
/// Dropping the observer is how a consumer disconnects: its receivers go
/// away with it and the hub forgets the batch channel once nobody listens.
pub struct Observer {
    id: Uuid,
    streams: StreamMap<String, BroadcastStream<BatchEvent>>,
    dropped: u64,
}

impl Observer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the next event. Returns `None` once every subscribed batch
    /// channel is drained and closed, or when nothing is subscribed.
    pub async fn recv(&mut self) -> Option<BatchEvent> {
        loop {
            match self.streams.next().await? {
                (_, Ok(event)) => return Some(event),
                (batch_id, Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    debug!("Observer {} lagged behind batch {}, skipped {} events", self.id, batch_id, skipped);
                    self.dropped += skipped;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<BatchEvent> {
        self.recv().now_or_never().flatten()
    }

    /// Number of events discarded because this observer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Fans batch events out to the observers registered for each batch id.
///
/// Each batch gets a `broadcast` channel on first subscription. A slow
/// observer loses the oldest events of that channel, publishers never wait.
pub struct NotificationHub {
    channels: RwLock<HashMap<String, broadcast::Sender<BatchEvent>>>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

impl NotificationHub {
    /// `capacity` is the per-observer backlog, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn observer(&self) -> Observer {
        Observer {
            id: Uuid::new_v4(),
            streams: StreamMap::new(),
            dropped: 0,
        }
    }

    /// Registers `observer` for `batch_id`. Subscribing twice is a no-op.
    pub fn subscribe(&self, batch_id: &str, observer: &mut Observer) {
        if observer.streams.contains_key(batch_id) {
            return;
        }
        let receiver = self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(batch_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        observer
            .streams
            .insert(batch_id.to_string(), BroadcastStream::new(receiver));
        debug!("Observer {} subscribed to batch {}", observer.id, batch_id);
    }

    /// Unsubscribing an observer that was never subscribed is a no-op.
    pub fn unsubscribe(&self, batch_id: &str, observer: &mut Observer) {
        if observer.streams.remove(batch_id).is_some() {
            self.prune(batch_id);
        }
    }

    /// Closes the batch channel, e.g. once it is deleted. Observers still get
    /// what was published before, then their stream for it ends.
    pub fn remove_batch(&self, batch_id: &str) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(batch_id);
    }

    /// Delivers `event` to every live observer of its batch without waiting
    /// on any of them.
    pub fn publish(&self, event: &BatchEvent) {
        let delivered = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            match channels.get(&event.batch_id) {
                Some(sender) => sender.send(event.clone()).is_ok(),
                None => return,
            }
        };
        if !delivered {
            self.prune(&event.batch_id);
        }
    }

    pub fn subscriber_count(&self, batch_id: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(batch_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    // forget the channel once its last observer is gone
    fn prune(&self, batch_id: &str) {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        if channels.get(batch_id).is_some_and(|sender| sender.receiver_count() == 0) {
            channels.remove(batch_id);
            debug!("Dropped channel of batch {}, no observers left", batch_id);
        }
    }
}
