// src/client/proxy.rs

//! The client end of a transport session: a typed stub that routes replies
//! by sequence number and fans pushed events out to local subscribers.

use crate::core::errors::AhaError;
use crate::core::topics::TopicHub;
use crate::core::waiter::Waiter;
use crate::core::wire::{self, WireMsg};
use crate::server::AnyStream;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::debug;

/// Outbound frames queued before backpressure applies.
const OUT_QUEUE_CAPACITY: usize = 256;

/// One open session to a remote (or in-process) cell.
#[derive(Debug)]
pub struct Proxy {
    out_tx: mpsc::Sender<WireMsg>,
    seq: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<Value, AhaError>>>>,
    topics: Arc<TopicHub>,
    fini: Arc<AtomicBool>,
    fini_tx: watch::Sender<bool>,
}

impl Proxy {
    /// Wraps an established stream, spawning its reader and writer tasks.
    pub fn from_stream(stream: AnyStream) -> Arc<Self> {
        let (out_tx, mut out_rx) = mpsc::channel::<WireMsg>(OUT_QUEUE_CAPACITY);
        let pending: Arc<DashMap<u64, oneshot::Sender<Result<Value, AhaError>>>> =
            Arc::new(DashMap::new());
        let topics = Arc::new(TopicHub::new());
        let fini = Arc::new(AtomicBool::new(false));
        let (fini_tx, _) = watch::channel(false);

        let (mut sink, mut read) = Framed::new(stream, wire::codec()).split();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let buf = match msg.encode() {
                    Ok(buf) => buf,
                    Err(_) => break,
                };
                if sink.send(buf).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let proxy = Arc::new(Self {
            out_tx,
            seq: AtomicU64::new(0),
            pending: pending.clone(),
            topics: topics.clone(),
            fini: fini.clone(),
            fini_tx: fini_tx.clone(),
        });

        tokio::spawn(async move {
            loop {
                let Some(frame) = read.next().await else { break };
                let Ok(buf) = frame else { break };
                let Ok(msg) = WireMsg::decode(&buf) else { break };
                match msg {
                    WireMsg::Reply { seq, value } => {
                        if let Some((_, tx)) = pending.remove(&seq) {
                            let _ = tx.send(Ok(value));
                        }
                    }
                    WireMsg::Fault { seq, code, mesg } => {
                        if let Some((_, tx)) = pending.remove(&seq) {
                            let _ = tx.send(Err(AhaError::from_code(&code, &mesg)));
                        }
                    }
                    WireMsg::Event { topic, data } => {
                        topics.publish(&topic, data);
                    }
                    WireMsg::Fini => break,
                    other => {
                        debug!("unexpected frame from server: {other:?}");
                        break;
                    }
                }
            }

            // Session teardown cancels all pending calls with a terminal
            // error, exactly once.
            fini.store(true, Ordering::SeqCst);
            let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
            for key in keys {
                if let Some((_, tx)) = pending.remove(&key) {
                    let _ = tx.send(Err(AhaError::LinkShut("session closed".to_string())));
                }
            }
            let _ = fini_tx.send(true);
        });

        proxy
    }

    /// Performs one RPC with a local deadline. On expiry the remote effect
    /// is ambiguous; the fabric's operations are idempotent for this
    /// reason.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AhaError> {
        if self.is_fini() {
            return Err(AhaError::LinkShut("session closed".to_string()));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        let msg = WireMsg::Call {
            seq,
            method: method.to_string(),
            params,
        };
        if self.out_tx.send(msg).await.is_err() {
            self.pending.remove(&seq);
            return Err(AhaError::LinkShut("session closed".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AhaError::LinkShut("session closed".to_string())),
            Err(_) => {
                self.pending.remove(&seq);
                Err(AhaError::Timeout(format!("call '{method}' timed out")))
            }
        }
    }

    /// Subscribes to a server topic, returning the local receiver the
    /// pushed events land on. Ordering is FIFO per topic.
    pub async fn subscribe(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<broadcast::Receiver<Value>, AhaError> {
        let rx = self.topics.subscribe(topic);
        self.call("subscribe", serde_json::json!({"topic": topic}), timeout)
            .await?;
        Ok(rx)
    }

    /// A counting waiter over locally observed events of a topic.
    pub fn waiter(&self, count: usize, topic: &str) -> Waiter {
        self.topics.waiter(count, topic)
    }

    /// Local access to the event hub (for already-subscribed topics).
    pub fn topics(&self) -> &Arc<TopicHub> {
        &self.topics
    }

    pub fn is_fini(&self) -> bool {
        self.fini.load(Ordering::SeqCst)
    }

    /// Resolves when the session has ended.
    pub async fn wait_fini(&self) {
        let mut rx = self.fini_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Orderly close. The server observes exactly one link-down.
    pub async fn fini(&self) {
        let _ = self.out_tx.send(WireMsg::Fini).await;
        self.fini.store(true, Ordering::SeqCst);
    }
}
