// src/core/nexus/wal.rs

//! The append-only nexus log file.
//!
//! Record framing: `u32 len | u32 crc32 | payload`, where the payload is a
//! bincode envelope holding the offset and the JSON-encoded edit. A torn or
//! corrupt tail record is discarded on load and the file truncated back to
//! the last good record.

use crate::core::errors::AhaError;
use bincode::{Decode, Encode};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Controls how often appended records reach the disk platter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WalFsync {
    /// fsync after every append. The durability the nexus contract assumes.
    #[default]
    Always,
    /// fsync on a one second cadence from a background task.
    EverySec,
    /// Leave flushing to the OS.
    No,
}

/// One durable record: the nexus offset and the serialised edit.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct WalRecord {
    pub indx: u64,
    pub edit: Vec<u8>,
}

/// The open log file, held by the nexus behind its write lock.
pub struct Wal {
    file: File,
    path: PathBuf,
    fsync: WalFsync,
}

impl Wal {
    pub async fn open(path: &Path, fsync: WalFsync) -> Result<Self, AhaError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            fsync,
        })
    }

    /// Appends one record; durable on return under the `Always` policy.
    pub async fn append(&mut self, rec: &WalRecord) -> Result<(), AhaError> {
        let payload = bincode::encode_to_vec(rec, bincode::config::standard())
            .map_err(|e| AhaError::Internal(format!("wal encode failed: {e}")))?;

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&CRC32.checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame).await?;
        self.file.flush().await?;
        if self.fsync == WalFsync::Always {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    /// Flushes pending data to disk. Driven on a cadence when the policy
    /// is `EverySec`.
    pub async fn sync_to_disk(&mut self) -> Result<(), AhaError> {
        self.file.sync_data().await?;
        Ok(())
    }

    /// Reads every intact record from a log file, truncating a damaged
    /// tail in place.
    pub async fn load(path: &Path) -> Result<Vec<WalRecord>, AhaError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let buf = tokio::fs::read(path).await?;

        let mut recs = Vec::new();
        let mut pos = 0usize;
        let mut good_len = 0usize;

        while pos + 8 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());

            let start = pos + 8;
            let end = match start.checked_add(len) {
                Some(end) if end <= buf.len() => end,
                _ => break,
            };

            let payload = &buf[start..end];
            if CRC32.checksum(payload) != crc {
                warn!(
                    "nexus log {} has a corrupt record at byte {}; discarding the tail",
                    path.display(),
                    pos
                );
                break;
            }

            let (rec, _): (WalRecord, usize) =
                match bincode::decode_from_slice(payload, bincode::config::standard()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(
                            "nexus log {} has an undecodable record at byte {} ({}); discarding the tail",
                            path.display(),
                            pos,
                            e
                        );
                        break;
                    }
                };

            recs.push(rec);
            pos = end;
            good_len = end;
        }

        if good_len < buf.len() {
            info!(
                "truncating nexus log {} from {} to {} bytes",
                path.display(),
                buf.len(),
                good_len
            );
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(good_len as u64).await?;
            file.sync_all().await?;
        }

        Ok(recs)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
