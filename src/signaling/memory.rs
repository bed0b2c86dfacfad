//! In-process broadcast fabric

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::fabric::{Fabric, Inbound, TopicLink};
use super::types::SignalingError;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Hub {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    reject: Option<String>,
}

/// Topic hub living inside the process; clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    hub: Arc<Hub>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fabric that refuses every subscription
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            hub: Arc::new(Hub {
                reject: Some(reason.into()),
                ..Hub::default()
            }),
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.hub.topics.lock().await;
        topics.get(topic).map_or(0, |subs| subs.len())
    }
}

impl Fabric for MemoryFabric {
    type Link = MemoryLink;

    async fn subscribe(&self, topic: &str) -> Result<(MemoryLink, Inbound), SignalingError> {
        if let Some(reason) = &self.hub.reject {
            return Err(SignalingError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }

        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.hub
            .topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        debug!("Subscriber {} joined topic {}", id, topic);

        let link = MemoryLink {
            hub: self.hub.clone(),
            topic: topic.to_string(),
            id,
            active: AtomicBool::new(true),
        };
        Ok((link, rx))
    }
}

pub struct MemoryLink {
    hub: Arc<Hub>,
    topic: String,
    id: u64,
    active: AtomicBool,
}

impl TopicLink for MemoryLink {
    async fn publish(&self, payload: String) -> Result<(), SignalingError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(SignalingError::NotConnected);
        }

        let mut topics = self.hub.topics.lock().await;
        if let Some(subs) = topics.get_mut(&self.topic) {
            subs.retain(|sub| !sub.tx.is_closed());
            for sub in subs.iter().filter(|sub| sub.id != self.id) {
                let _ = sub.tx.send(payload.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut topics = self.hub.topics.lock().await;
        if let Some(subs) = topics.get_mut(&self.topic) {
            subs.retain(|sub| sub.id != self.id);
            if subs.is_empty() {
                topics.remove(&self.topic);
            }
        }
        debug!("Subscriber {} left topic {}", self.id, self.topic);
    }
}
