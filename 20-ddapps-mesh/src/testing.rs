//! Helpers for asserting on bus traffic.

use std::time::Duration;

use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    time::timeout,
};

use crate::bus::{Bus, Delivery, Inbox};

/// Subscribes to a set of topics and records every delivery made to them.
pub struct Recorder {
    bus: Bus,
    topics: Vec<String>,
    inbox: Inbox,
    deliveries: UnboundedReceiver<Delivery>,
}

impl Recorder {
    pub fn new<I, T>(bus: &Bus, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let (inbox, deliveries) = mpsc::unbounded_channel();
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        for topic in &topics {
            bus.subscribe(topic.clone(), &inbox);
        }
        Self {
            bus: bus.clone(),
            topics,
            inbox,
            deliveries,
        }
    }

    /// Next delivery, or `None` if nothing arrives within `limit`.
    pub async fn next(&mut self, limit: Duration) -> Option<Delivery> {
        timeout(limit, self.deliveries.recv()).await.ok().flatten()
    }

    /// Waits for the next delivery of message type `kind`, skipping others.
    pub async fn expect(&mut self, kind: &str, limit: Duration) -> Option<Delivery> {
        timeout(limit, async {
            loop {
                let delivery = self.deliveries.recv().await?;
                if delivery.message.kind() == kind {
                    return Some(delivery);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Everything delivered so far without waiting.
    pub fn drain(&mut self) -> Vec<Delivery> {
        let mut drained = Vec::new();
        while let Ok(delivery) = self.deliveries.try_recv() {
            drained.push(delivery);
        }
        drained
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        for topic in &self.topics {
            self.bus.unsubscribe(topic, &self.inbox);
        }
    }
}
