// src/core/topics.rs

//! The topic hub: per-topic broadcast channels feeding connected sessions,
//! pool handles, and test waiters.

use crate::core::waiter::Waiter;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// The capacity of each individual broadcast channel.
const CHANNEL_CAPACITY: usize = 256;

/// `TopicHub` is the central fan-out point for fabric events
/// (`aha:svcadd`, `aha:svcdown`, per-pool topics, nexus edits).
/// It uses `DashMap` for lock-free management of topic subscriptions.
#[derive(Debug, Default)]
pub struct TopicHub {
    topics: DashMap<String, Arc<Sender<Value>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Default::default()
    }

    /// Subscribes to a topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> Receiver<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Publishes an event to all current subscribers of a topic.
    /// Returns the number of receivers the event reached.
    pub fn publish(&self, topic: &str, data: Value) -> usize {
        let Some(sender) = self.topics.get(topic) else {
            return 0;
        };
        sender.send(data).unwrap_or(0)
    }

    /// Creates a counting waiter for `count` events on a topic.
    pub fn waiter(&self, count: usize, topic: &str) -> Waiter {
        Waiter::new(self.subscribe(topic), count)
    }

    /// Drops topics that no longer have any subscribers.
    pub fn purge_empty_topics(&self) -> usize {
        let mut purged = 0;
        self.topics.retain(|_topic, sender| {
            if sender.receiver_count() == 0 {
                purged += 1;
                false
            } else {
                true
            }
        });
        if purged > 0 {
            debug!("Purged {} empty event topics.", purged);
        }
        purged
    }
}
