//! In-process message bus.
//!
//! Topics are plain strings: component roles, custom component names and
//! connection identifiers. Each subscriber is an unbounded channel, so a
//! publish never blocks and every subscriber sees messages in publish order.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::error::BusError;
use crate::message::Message;

/// Identifier of one client request's causal context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

/// Ambient context propagated from a client request to every message it causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub id: ContextId,
    pub token: String,
    /// Whether components should report their participation to the client.
    pub notify: bool,
}

/// A message as received on one topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub message: Message,
    pub trace: Option<TraceContext>,
}

pub type Inbox = UnboundedSender<Delivery>;

#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Vec<Inbox>>>,
    next_context: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `inbox` to `topic`. Subscribing the same inbox twice is a no-op.
    pub fn subscribe(&self, topic: impl Into<String>, inbox: &Inbox) {
        let mut topics = self.inner.topics.write();
        let subscribers = topics.entry(topic.into()).or_default();
        if !subscribers.iter().any(|existing| existing.same_channel(inbox)) {
            subscribers.push(inbox.clone());
        }
    }

    pub fn unsubscribe(&self, topic: &str, inbox: &Inbox) {
        let mut topics = self.inner.topics.write();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|existing| !existing.same_channel(inbox));
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Delivers `message` to every subscriber of `message.destination`.
    pub fn publish(&self, message: Message, trace: Option<TraceContext>) -> Result<(), BusError> {
        let topic = message.destination.clone();
        let mut topics = self.inner.topics.write();
        let Some(subscribers) = topics.get_mut(&topic) else {
            return Err(BusError::NoSubscriber(topic));
        };

        subscribers.retain(|inbox| !inbox.is_closed());
        if subscribers.is_empty() {
            topics.remove(&topic);
            return Err(BusError::NoSubscriber(topic));
        }

        trace!(topic = %topic, kind = message.kind(), digest = %message.digest(), "publish");
        for inbox in subscribers.iter() {
            let _ = inbox.send(Delivery {
                topic: topic.clone(),
                message: message.clone(),
                trace: trace.clone(),
            });
        }
        Ok(())
    }

    /// Allocates a fresh context id. Ids increase monotonically per bus.
    pub fn next_context(&self) -> ContextId {
        ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
