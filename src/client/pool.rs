// src/client/pool.rs

//! Client-side pool handles: a live view of a service pool that hands out
//! member sessions round-robin and rebalances on membership deltas.

use super::cache::{AhaClient, dial_svc, resolve_svc};
use super::proxy::Proxy;
use super::DialOpts;
use crate::core::errors::AhaError;
use crate::core::pool::{PoolDef, pool_topic};
use crate::core::topics::TopicHub;
use crate::core::urls::UrlInfo;
use crate::core::waiter::Waiter;
use indexmap::IndexMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A member session slot; dialed lazily and redialed after drops.
#[derive(Default, Debug)]
struct Member {
    proxy: Option<Arc<Proxy>>,
}

/// An open handle on a service pool.
///
/// `proxy(timeout)` returns the next ready member session in round-robin
/// order. Membership deltas stream in on the pool topic and surface to
/// callers as local `svc:add` / `svc:del` / `pool:reset` events.
#[derive(Debug)]
pub struct PoolProxy {
    aha: Arc<AhaClient>,
    fullname: String,
    urlinfo: UrlInfo,
    opts: DialOpts,
    members: Mutex<IndexMap<String, Member>>,
    offs: Mutex<usize>,
    events: Arc<TopicHub>,
}

impl PoolProxy {
    /// Opens a handle, reading the current membership and subscribing to
    /// the pool topic. An empty pool cannot be dialed.
    pub async fn open(
        aha: Arc<AhaClient>,
        fullname: &str,
        urlinfo: &UrlInfo,
        opts: DialOpts,
    ) -> Result<Arc<Self>, AhaError> {
        let session = aha.proxy().await?;
        let value = session
            .call("getAhaPool", json!({"name": fullname}), opts.timeout())
            .await?;
        if value.is_null() {
            return Err(AhaError::NoSuchName(format!("no such pool: {fullname}")));
        }
        let pooldef: PoolDef = serde_json::from_value(value)
            .map_err(|e| AhaError::Internal(format!("bad pool record: {e}")))?;
        if pooldef.services.is_empty() {
            return Err(AhaError::BadArg(format!(
                "pool {fullname} has no members to dial"
            )));
        }

        let mut members = IndexMap::new();
        for name in pooldef.services.keys() {
            members.insert(name.clone(), Member::default());
        }

        let pool = Arc::new(Self {
            aha,
            fullname: fullname.to_string(),
            urlinfo: urlinfo.clone(),
            opts,
            members: Mutex::new(members),
            offs: Mutex::new(0),
            events: Arc::new(TopicHub::new()),
        });

        pool.clone().run_topology_task(session).await?;
        Ok(pool)
    }

    /// A counting waiter over this handle's local events
    /// (`svc:add`, `svc:del`, `pool:reset`).
    pub fn waiter(&self, count: usize, topic: &str) -> Waiter {
        self.events.waiter(count, topic)
    }

    /// Subscribes to the pool topic on the AHA session and keeps the local
    /// membership in step. Re-subscribes (and fires `pool:reset`) whenever
    /// the AHA session itself reconnects. The task holds only a weak
    /// reference, so a dropped handle winds it down.
    async fn run_topology_task(self: Arc<Self>, session: Arc<Proxy>) -> Result<(), AhaError> {
        let topic = pool_topic(&self.fullname);
        let mut rx = session.subscribe(&topic, self.opts.timeout()).await?;
        let weak = Arc::downgrade(&self);
        drop(self);

        tokio::spawn(async move {
            let mut session = session;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(pool) = weak.upgrade() else { return };
                        match event {
                            Ok(data) => pool.on_pool_event(data).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(_) => {
                                // Topic stream ended with the session.
                                session.wait_fini().await;
                            }
                        }
                    }
                    _ = session.wait_fini() => {}
                }

                if session.is_fini() {
                    // The AHA session dropped. Reconnect with backoff,
                    // rebuild membership from a fresh read, and tell the
                    // caller the topology may have shifted wholesale.
                    loop {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        let Some(pool) = weak.upgrade() else { return };
                        let Ok(fresh) = pool.aha.proxy().await else { continue };
                        let Ok(sub) = fresh.subscribe(&topic, pool.opts.timeout()).await else {
                            continue;
                        };
                        let value = fresh
                            .call(
                                "getAhaPool",
                                json!({"name": pool.fullname}),
                                pool.opts.timeout(),
                            )
                            .await;
                        let Ok(value) = value else { continue };
                        let Ok(pooldef) = serde_json::from_value::<PoolDef>(value) else {
                            // The pool is gone; nothing left to track.
                            return;
                        };

                        let mut members = pool.members.lock().await;
                        members.clear();
                        for name in pooldef.services.keys() {
                            members.insert(name.clone(), Member::default());
                        }
                        drop(members);

                        pool.events.publish("pool:reset", json!({}));
                        session = fresh;
                        rx = sub;
                        break;
                    }
                    if session.is_fini() {
                        debug!("pool handle lost its aha session");
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_pool_event(&self, data: Value) {
        let event = data.get("event").and_then(Value::as_str).unwrap_or("");
        let svcname = data.get("svcname").and_then(Value::as_str).unwrap_or("");
        match event {
            "svc:add" => {
                self.members
                    .lock()
                    .await
                    .insert(svcname.to_string(), Member::default());
                self.events.publish("svc:add", json!({"svcname": svcname}));
            }
            "svc:del" => {
                self.members.lock().await.shift_remove(svcname);
                self.events.publish("svc:del", json!({"svcname": svcname}));
            }
            "pool:del" => {
                self.members.lock().await.clear();
                self.events.publish("pool:reset", json!({}));
            }
            other => debug!("pool {}: unhandled event '{other}'", self.fullname),
        }
    }

    /// Returns the next ready member session, round-robin. Members that
    /// cannot be dialed are skipped; a pool with no dialable members times
    /// out.
    pub async fn proxy(&self, timeout: std::time::Duration) -> Result<Arc<Proxy>, AhaError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let names: Vec<String> = {
                let members = self.members.lock().await;
                members.keys().cloned().collect()
            };
            if names.is_empty() {
                if tokio::time::Instant::now() >= deadline {
                    return Err(AhaError::Timeout(format!(
                        "pool {} has no members",
                        self.fullname
                    )));
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }

            for _ in 0..names.len() {
                let name = {
                    let mut offs = self.offs.lock().await;
                    let name = names[*offs % names.len()].clone();
                    *offs = (*offs + 1) % names.len();
                    name
                };

                match self.member_proxy(&name).await {
                    Ok(proxy) => return Ok(proxy),
                    Err(e) => {
                        warn!("pool {}: member {name} not dialable: {e}", self.fullname);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AhaError::Timeout(format!(
                    "no ready member in pool {}",
                    self.fullname
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Returns (dialing if necessary) the session for one member.
    async fn member_proxy(&self, name: &str) -> Result<Arc<Proxy>, AhaError> {
        {
            let members = self.members.lock().await;
            if let Some(member) = members.get(name)
                && let Some(proxy) = &member.proxy
                && !proxy.is_fini()
            {
                return Ok(proxy.clone());
            }
        }

        let aha = self.aha.proxy().await?;
        let svc = resolve_svc(&aha, name, &self.opts).await?;
        let proxy = dial_svc(&svc, &self.urlinfo, &self.opts).await?;

        let mut members = self.members.lock().await;
        if let Some(member) = members.get_mut(name) {
            member.proxy = Some(proxy.clone());
        }
        Ok(proxy)
    }
}
