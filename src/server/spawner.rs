// src/server/spawner.rs

//! Spawns the AHA cell's background tasks: stale-record teardown, hive
//! snapshots, log fsync cadence, topic housekeeping, and the mirror
//! worker.

use crate::core::aha::AhaCell;
use crate::core::nexus::WalFsync;
use crate::core::nexus::mirror::run_mirror_loop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn_all(aha: &Arc<AhaCell>, shutdown_tx: &broadcast::Sender<()>) {
    // Records left online by a previous run go down through the nexus
    // shortly after boot, where topic subscribers can observe them.
    {
        let aha = aha.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Err(e) = aha.down_stale_svcs().await {
                warn!("stale service teardown failed: {e}");
            }
        });
    }

    // Periodic hive snapshots bound log replay at boot; a final snapshot
    // runs at shutdown.
    {
        let aha = aha.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        if let Err(e) = aha.save_snapshot().await {
                            error!("final hive snapshot failed: {e}");
                        } else {
                            info!("final hive snapshot written.");
                        }
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = aha.save_snapshot().await {
                            warn!("hive snapshot failed: {e}");
                        }
                    }
                }
            }
        });
    }

    // The everysec fsync cadence, when configured.
    if aha.cell.conf.nexslog_fsync == WalFsync::EverySec {
        let aha = aha.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        let _ = aha.nexus.sync_to_disk().await;
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(e) = aha.nexus.sync_to_disk().await {
                            warn!("nexus log fsync failed: {e}");
                        }
                    }
                }
            }
        });
    }

    // Topic channels with no remaining subscribers get purged.
    {
        let aha = aha.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tick.tick() => {
                        aha.topics.purge_empty_topics();
                    }
                }
            }
        });
    }

    // Mirrors follow their upstream until shutdown.
    if let Some(upstream) = aha.cell.conf.mirror.clone() {
        let aha = aha.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            run_mirror_loop(aha, upstream, shutdown_rx).await;
        });
    }
}
