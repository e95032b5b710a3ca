// src/core/nexus/mod.rs

//! The nexus: a durable, totally-ordered edit log driving every state
//! mutation of a cell, on the leader and on any mirrors.
//!
//! There is exactly one mutation path: build a [`NexusEdit`], hand it to
//! [`NexusRoot::issue`] (leader) or receive it from the replication stream
//! (mirror), and let the applier mutate the hive. Reads never come here.

pub mod mirror;
pub mod wal;

use crate::core::auth::UserDef;
use crate::core::errors::AhaError;
use crate::core::provision::ProvToken;
use crate::core::registry::SvcInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::warn;

pub use wal::{Wal, WalFsync, WalRecord};

/// Capacity of the live-edit broadcast feeding follower streams.
const LIVE_BUS_CAPACITY: usize = 4096;

/// Every mutation the fabric can commit, in its wire and WAL form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "edit", content = "data")]
pub enum NexusEdit {
    #[serde(rename = "svc:add")]
    SvcAdd {
        name: String,
        network: String,
        info: SvcInfo,
    },
    #[serde(rename = "svc:down")]
    SvcDown {
        name: String,
        network: String,
        link: String,
    },
    #[serde(rename = "svc:mod")]
    SvcMod {
        name: String,
        network: String,
        info: Value,
    },
    #[serde(rename = "svc:del")]
    SvcDel { name: String, network: String },

    #[serde(rename = "pool:add")]
    PoolAdd {
        name: String,
        network: String,
        creator: String,
        created: i64,
    },
    #[serde(rename = "pool:del")]
    PoolDel { name: String, network: String },
    #[serde(rename = "pool:svc:add")]
    PoolSvcAdd {
        name: String,
        network: String,
        svc: String,
        creator: String,
        created: i64,
    },
    #[serde(rename = "pool:svc:del")]
    PoolSvcDel {
        name: String,
        network: String,
        svc: String,
    },

    #[serde(rename = "ca:add")]
    CaAdd {
        network: String,
        cert: String,
        key: String,
    },
    #[serde(rename = "cert:sign")]
    CertSign {
        kind: String,
        cn: String,
        serial: String,
    },

    #[serde(rename = "prov:add")]
    ProvAdd { token: ProvToken },
    #[serde(rename = "prov:consume")]
    ProvConsume { iden: String },
    #[serde(rename = "prov:del")]
    ProvDel { iden: String },

    #[serde(rename = "user:add")]
    UserAdd { user: UserDef },
    #[serde(rename = "user:passwd")]
    UserPasswd { name: String, shadow: String },
    #[serde(rename = "user:locked")]
    UserLocked { name: String, locked: bool },
    #[serde(rename = "user:admin")]
    UserAdmin { name: String, admin: bool },
}

/// One committed log entry, as replicated to mirrors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NexusEntry {
    pub indx: u64,
    pub edit: NexusEdit,
}

/// Implemented by the cell state that owns the hive; the nexus calls it on
/// exactly one task at a time, in offset order.
pub trait NexusApplier: Send + Sync {
    fn apply(&self, indx: u64, edit: &NexusEdit);
}

/// The log root of one cell. Leader and mirror share this type; the
/// follower flag only changes which entry points are legal.
pub struct NexusRoot {
    wal: Mutex<Wal>,
    /// Count of applied entries; the next offset to assign.
    indx: AtomicU64,
    applied_tx: watch::Sender<u64>,
    applied_rx: watch::Receiver<u64>,
    live_tx: broadcast::Sender<NexusEntry>,
    follower: AtomicBool,
    /// Set when a durability failure makes further writes unsafe.
    failed: AtomicBool,
}

impl NexusRoot {
    /// Opens (or creates) the log and returns any records already on disk
    /// for the caller to replay against its snapshot.
    pub async fn open(
        path: &Path,
        fsync: WalFsync,
        follower: bool,
    ) -> Result<(Self, Vec<WalRecord>), AhaError> {
        let recs = Wal::load(path).await?;
        let wal = Wal::open(path, fsync).await?;

        let (applied_tx, applied_rx) = watch::channel(0u64);
        let (live_tx, _) = broadcast::channel(LIVE_BUS_CAPACITY);

        Ok((
            Self {
                wal: Mutex::new(wal),
                indx: AtomicU64::new(0),
                applied_tx,
                applied_rx,
                live_tx,
                follower: AtomicBool::new(follower),
                failed: AtomicBool::new(false),
            },
            recs,
        ))
    }

    /// Records that boot-time replay has reached `count` applied entries.
    pub fn mark_applied(&self, count: u64) {
        self.indx.store(count, Ordering::SeqCst);
        let _ = self.applied_tx.send(count);
    }

    /// The count of committed entries; entry `k` has offset `k`.
    pub fn current_indx(&self) -> u64 {
        self.indx.load(Ordering::SeqCst)
    }

    pub fn is_follower(&self) -> bool {
        self.follower.load(Ordering::SeqCst)
    }

    /// Promotes a mirror that has been told to lead (or a leader booting).
    pub fn set_follower(&self, follower: bool) {
        self.follower.store(follower, Ordering::SeqCst);
    }

    /// Commits one edit on the leader: durable append, apply, broadcast.
    /// A durability failure is fatal to the caller and poisons the root so
    /// later writes cannot proceed against stale state.
    pub async fn issue(
        &self,
        edit: NexusEdit,
        applier: &dyn NexusApplier,
    ) -> Result<u64, AhaError> {
        if self.follower.load(Ordering::SeqCst) {
            return Err(AhaError::NotReady(
                "mirror cells do not accept writes; dial the leader".to_string(),
            ));
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(AhaError::NotReady(
                "nexus log is failed; cell is passive until restart".to_string(),
            ));
        }

        let mut wal = self.wal.lock().await;
        let indx = self.indx.load(Ordering::SeqCst);
        let rec = WalRecord {
            indx,
            edit: serde_json::to_vec(&edit)?,
        };

        if let Err(e) = wal.append(&rec).await {
            self.failed.store(true, Ordering::SeqCst);
            warn!("nexus append failed at offset {}: {}", indx, e);
            return Err(e);
        }

        applier.apply(indx, &edit);
        self.indx.store(indx + 1, Ordering::SeqCst);
        let _ = self.applied_tx.send(indx + 1);
        let _ = self.live_tx.send(NexusEntry { indx, edit });
        Ok(indx)
    }

    /// Applies one replicated entry on a follower. Entries must arrive in
    /// offset order; a gap means this follower needs a snapshot resync.
    pub async fn apply_entry(
        &self,
        entry: &NexusEntry,
        applier: &dyn NexusApplier,
    ) -> Result<(), AhaError> {
        let mut wal = self.wal.lock().await;
        let count = self.indx.load(Ordering::SeqCst);

        if entry.indx < count {
            // Already applied; the upstream replayed an overlap.
            return Ok(());
        }
        if entry.indx > count {
            return Err(AhaError::BadStorageVersion(format!(
                "nexus gap: have {} entries, got offset {}",
                count, entry.indx
            )));
        }

        let rec = WalRecord {
            indx: entry.indx,
            edit: serde_json::to_vec(&entry.edit)?,
        };
        wal.append(&rec).await?;

        applier.apply(entry.indx, &entry.edit);
        self.indx.store(entry.indx + 1, Ordering::SeqCst);
        let _ = self.applied_tx.send(entry.indx + 1);
        let _ = self.live_tx.send(entry.clone());
        Ok(())
    }

    /// Waits until at least `count` entries are applied locally.
    pub async fn wait_offs(&self, count: u64, timeout: Duration) -> Result<(), AhaError> {
        let mut rx = self.applied_rx.clone();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() >= count {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| AhaError::Timeout(format!("offset {count} not reached")))?;

        if self.current_indx() >= count {
            Ok(())
        } else {
            Err(AhaError::Timeout(format!("offset {count} not reached")))
        }
    }

    /// A live feed of committed entries, for follower sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<NexusEntry> {
        self.live_tx.subscribe()
    }

    /// Reads committed entries at or after `from` back out of the log.
    pub async fn read_entries(&self, from: u64) -> Result<Vec<NexusEntry>, AhaError> {
        let wal = self.wal.lock().await;
        let recs = Wal::load(wal.path()).await?;
        drop(wal);

        let mut out = Vec::new();
        for rec in recs {
            if rec.indx < from {
                continue;
            }
            let edit: NexusEdit = serde_json::from_slice(&rec.edit)?;
            out.push(NexusEntry {
                indx: rec.indx,
                edit,
            });
        }
        Ok(out)
    }

    /// Flushes buffered appends; driven on a cadence for `everysec`.
    pub async fn sync_to_disk(&self) -> Result<(), AhaError> {
        self.wal.lock().await.sync_to_disk().await
    }
}
