// src/core/waiter.rs

//! A bounded-counting event waiter.
//!
//! Test and client code frequently needs "return once N events of topic T
//! have been observed, or give up at the deadline". The waiter must be
//! created *before* the action that fires the events, so none are missed.

use serde_json::Value;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio::sync::broadcast::Receiver;

/// Collects up to `count` events from a broadcast subscription.
pub struct Waiter {
    stream: BroadcastStream<Value>,
    count: usize,
    seen: Vec<Value>,
}

impl Waiter {
    pub fn new(rx: Receiver<Value>, count: usize) -> Self {
        Self {
            stream: BroadcastStream::new(rx),
            count,
            seen: Vec::new(),
        }
    }

    /// Waits until `count` events have been observed or the deadline
    /// expires. Returns the events collected so far either way; the caller
    /// checks the length. Events observed by an earlier `wait` call on the
    /// same waiter are retained.
    pub async fn wait(&mut self, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;

        while self.seen.len() < self.count {
            let step = tokio::time::timeout_at(deadline, self.stream.next()).await;
            match step {
                Ok(Some(Ok(data))) => self.seen.push(data),
                // A lagged receiver skips to the oldest retained event.
                Ok(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Ok(None) => break,
                Err(_) => break,
            }
        }
        self.seen.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn waiter_collects_and_times_out() {
        let (tx, rx) = broadcast::channel(8);
        let mut waiter = Waiter::new(rx, 2);

        tx.send(serde_json::json!({"n": 1})).unwrap();
        tx.send(serde_json::json!({"n": 2})).unwrap();

        let events = waiter.wait(Duration::from_millis(200)).await;
        assert_eq!(events.len(), 2);

        let (tx, rx) = broadcast::channel(8);
        let mut waiter = Waiter::new(rx, 3);
        tx.send(serde_json::json!({"n": 1})).unwrap();

        let events = waiter.wait(Duration::from_millis(50)).await;
        assert_eq!(events.len(), 1);
    }
}
