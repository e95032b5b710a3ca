// src/core/nexus/mirror.rs

//! The mirror worker: a follower's pull loop against its upstream leader.
//!
//! The worker subscribes to the live edit stream first, then backfills
//! from its current offset, so nothing is lost in between; duplicate
//! entries are skipped by offset. A gap (the leader no longer holds our
//! next offset) triggers a full snapshot resync.

use crate::client::{DialOpts, open_url_opts};
use crate::core::aha::AhaCell;
use crate::core::errors::AhaError;
use crate::core::nexus::NexusEntry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Runs until shutdown, keeping a mirror in step with its upstream.
pub async fn run_mirror_loop(
    aha: Arc<AhaCell>,
    upstream_url: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let opts = DialOpts {
        certdir: Some(aha.cell.certdir.clone()),
        network: aha.cell.conf.aha_network.clone(),
        insecure: false,
        timeout: Some(aha.cell.conf.aha_timeout),
    };

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            res = sync_once(&aha, &upstream_url, &opts) => {
                if let Err(e) = res {
                    debug!("mirror sync against {upstream_url} ended: {e}");
                }
                aha.upstream.lock().await.take();
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

/// One full connect-catchup-follow cycle. Returns when the session drops.
async fn sync_once(
    aha: &Arc<AhaCell>,
    upstream_url: &str,
    opts: &DialOpts,
) -> Result<(), AhaError> {
    let proxy = open_url_opts(upstream_url, opts).await?;
    let timeout = opts.timeout();

    // Live stream first, then backfill; overlap resolves by offset.
    let mut live = proxy.topics().subscribe("nexus:log");
    proxy.call("subscribeNexus", json!({}), timeout).await?;

    let entries = proxy
        .call(
            "getNexsEdits",
            json!({"offs": aha.nexus.current_indx()}),
            timeout,
        )
        .await?;
    let entries: Vec<NexusEntry> = serde_json::from_value(entries)
        .map_err(|e| AhaError::Internal(format!("bad edit stream: {e}")))?;

    for entry in &entries {
        if let Err(e) = aha.nexus.apply_entry(entry, aha.as_ref()).await {
            warn!("mirror backfill hit a gap ({e}); resyncing from snapshot");
            resync_snapshot(aha, &proxy, timeout).await?;
            break;
        }
    }

    *aha.upstream.lock().await = Some(proxy.clone());
    info!(
        "mirror in sync with {upstream_url} at offset {}",
        aha.nexus.current_indx()
    );

    loop {
        tokio::select! {
            _ = proxy.wait_fini() => {
                return Err(AhaError::LinkShut("upstream session closed".to_string()));
            }
            event = live.recv() => {
                let data = match event {
                    Ok(data) => data,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("mirror stream lagged by {n} events; resyncing");
                        resync_snapshot(aha, &proxy, timeout).await?;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AhaError::LinkShut("upstream stream closed".to_string()));
                    }
                };
                let entry: NexusEntry = serde_json::from_value(data)
                    .map_err(|e| AhaError::Internal(format!("bad edit event: {e}")))?;
                if let Err(e) = aha.nexus.apply_entry(&entry, aha.as_ref()).await {
                    warn!("mirror apply hit a gap ({e}); resyncing from snapshot");
                    resync_snapshot(aha, &proxy, timeout).await?;
                }
            }
        }
    }
}

/// Pulls the leader's full hive state and adopts its offset.
async fn resync_snapshot(
    aha: &Arc<AhaCell>,
    proxy: &Arc<crate::client::Proxy>,
    timeout: Duration,
) -> Result<(), AhaError> {
    let snap = proxy.call("getNexsSnapshot", json!({}), timeout).await?;
    let indx = snap.get("indx").and_then(|v| v.as_u64()).unwrap_or(0);
    aha.hive
        .load(snap.get("tree").cloned().unwrap_or(serde_json::Value::Null))
        .map_err(|e| AhaError::Internal(format!("snapshot load failed: {e}")))?;
    aha.nexus.mark_applied(indx);
    aha.save_snapshot().await?;
    Ok(())
}
