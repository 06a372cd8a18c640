// src/subscription.rs - Per-subscriber delivery of produced snapshots
//
// notify(items)
//     |
//     +--> [queue 1] --> delivery task 1 --> filter, dedup --> subscriber1.on_items()
//     +--> [queue 2] --> delivery task 2 --> filter, dedup --> subscriber2.on_items()
//     +--> [queue N] --> ...
//
// A slow subscriber only delays its own queue. The initial state of a new
// subscriber is queued before any live batch, and the dedup table drops live
// items the initial state already covered.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Item with a per-stream monotonic sequence
pub trait Sequenced {
    type Key: Clone + Eq + Hash + Send + 'static;

    /// Identifies the stream the item belongs to (one entity, one occurrence)
    fn stream_key(&self) -> Self::Key;

    fn sequence(&self) -> u64;
}

pub trait Filter<T>: Send + Sync {
    fn matches(&self, item: &T) -> bool;
}

/// Receives batches of items matching its filter
#[async_trait]
pub trait Subscriber<T: Send + Sync>: Send + Sync {
    async fn on_items(&self, items: &[T]);
}

struct SubscriberChannel<T> {
    subscriber: Arc<dyn Subscriber<T>>,
    sender: mpsc::UnboundedSender<Arc<Vec<T>>>,
    worker: JoinHandle<()>,
}

fn same_subscriber<T>(a: &Arc<dyn Subscriber<T>>, b: &Arc<dyn Subscriber<T>>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Fan-out of item batches to registered subscribers
pub struct Distribution<T> {
    channels: RwLock<Vec<SubscriberChannel<T>>>,
}

impl<T> Distribution<T>
where
    T: Sequenced + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Register `subscriber`. `initial` is called under the registration
    /// lock so no batch can be notified between the initial state and the
    /// first live batch. Must be called within a Tokio runtime.
    pub fn subscribe<F, I>(&self, subscriber: Arc<dyn Subscriber<T>>, filter: F, initial: I)
    where
        F: Filter<T> + 'static,
        I: FnOnce() -> Vec<T>,
    {
        let mut channels = self.channels.write();
        if let Some(pos) = channels.iter().position(|c| same_subscriber(&c.subscriber, &subscriber)) {
            let previous = channels.remove(pos);
            previous.worker.abort();
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<Vec<T>>>();
        let target = subscriber.clone();
        let worker = tokio::spawn(async move {
            let mut last_seen: HashMap<T::Key, u64> = HashMap::new();
            while let Some(batch) = receiver.recv().await {
                let selected: Vec<T> = batch
                    .iter()
                    .filter(|item| filter.matches(item))
                    .filter(|item| {
                        let key = item.stream_key();
                        let seq = item.sequence();
                        match last_seen.get(&key) {
                            Some(last) if *last >= seq => false,
                            _ => {
                                last_seen.insert(key, seq);
                                true
                            }
                        }
                    })
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    continue;
                }
                trace!("Delivering {} items", selected.len());
                target.on_items(&selected).await;
            }
        });

        let snapshot = initial();
        if !snapshot.is_empty() {
            let _ = sender.send(Arc::new(snapshot));
        }
        channels.push(SubscriberChannel {
            subscriber,
            sender,
            worker,
        });
        debug!("Subscriber registered ({} total)", channels.len());
    }

    /// Returns false if the subscriber was not registered
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber<T>>) -> bool {
        let mut channels = self.channels.write();
        match channels.iter().position(|c| same_subscriber(&c.subscriber, subscriber)) {
            Some(pos) => {
                // Dropping the sender lets the worker drain what is queued
                channels.remove(pos);
                debug!("Subscriber removed ({} left)", channels.len());
                true
            }
            None => false,
        }
    }

    pub fn notify(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let batch = Arc::new(items);
        let channels = self.channels.read();
        for channel in channels.iter() {
            if channel.sender.send(batch.clone()).is_err() {
                debug!("Delivery task of a subscriber has stopped");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Drop every subscriber; queued batches are still delivered
    pub fn clear(&self) {
        self.channels.write().clear();
    }
}

impl<T> Default for Distribution<T>
where
    T: Sequenced + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
