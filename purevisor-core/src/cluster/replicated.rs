//! Distributed volume writes over the replicated log
//!
//! The leader serializes {volume-name, offset, data} as a Write entry and
//! submits it; the apply path on every node performs the write against the
//! local pool copy. Reads bypass the log and serve from the local pool,
//! accepting follower staleness. Volume deletion is itself a log entry, so
//! every write submitted before the delete is applied before the volume
//! disappears.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::cluster::log::{ApplyHook, EntryKind, LogEntry, LogError, LogIndex, ReplicatedLog};
use crate::cluster::{ClusterTransport, NodeId};
use crate::config::CoreConfig;
use crate::storage::{ExtentPool, PoolError};

/// Payload of an `EntryKind::Write` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeWrite {
    pub volume: String,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Payload of an `EntryKind::DeleteVolume` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDelete {
    pub volume: String,
}

/// Apply sink binding committed entries to the local pool.
pub struct PoolApply {
    pool: Arc<Mutex<ExtentPool>>,
}

impl PoolApply {
    pub fn new(pool: Arc<Mutex<ExtentPool>>) -> Self {
        PoolApply { pool }
    }
}

impl ApplyHook for PoolApply {
    fn apply(&mut self, entry: &LogEntry) {
        match entry.kind {
            EntryKind::Write => {
                let Ok(write) = postcard::from_bytes::<VolumeWrite>(&entry.payload) else {
                    log_warn!("replicated write {}: undecodable payload", entry.index);
                    return;
                };
                let mut pool = self.pool.lock();
                match pool.find_volume(&write.volume).map(|v| v.id) {
                    Some(volume) => {
                        if let Err(err) = pool.volume_write(volume, write.offset, &write.data) {
                            log_error!("replicated write {} to {}: {:?}", entry.index, write.volume, err);
                        }
                    }
                    // Deletes drain through the log, so this only happens
                    // when a write raced past its volume's delete entry at
                    // the submitter.
                    None => log_warn!("replicated write {}: volume {} missing", entry.index, write.volume),
                }
            }
            EntryKind::DeleteVolume => {
                let Ok(del) = postcard::from_bytes::<VolumeDelete>(&entry.payload) else {
                    return;
                };
                let mut pool = self.pool.lock();
                if let Some(id) = pool.find_volume(&del.volume).map(|v| v.id) {
                    let _ = pool.delete_volume(id);
                }
            }
            _ => {}
        }
    }
}

/// The cluster-wide storage front end on one node.
pub struct ClusterStore {
    log: ReplicatedLog,
    pool: Arc<Mutex<ExtentPool>>,
}

impl ClusterStore {
    pub fn new(
        node: NodeId,
        cfg: &CoreConfig,
        pool: Arc<Mutex<ExtentPool>>,
        transport: Box<dyn ClusterTransport>,
        seed: u64,
    ) -> Self {
        let apply = Box::new(PoolApply::new(pool.clone()));
        ClusterStore { log: ReplicatedLog::new(node, cfg, transport, apply, seed), pool }
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut ReplicatedLog {
        &mut self.log
    }

    /// Submit a replicated write. Leader only; the returned index can be
    /// polled for commitment.
    pub fn write(&mut self, volume: &str, offset: u64, data: &[u8]) -> Result<LogIndex, LogError> {
        let payload = postcard::to_allocvec(&VolumeWrite {
            volume: String::from(volume),
            offset,
            data: data.to_vec(),
        })
        .map_err(|_| LogError::BadMessage)?;
        self.log.submit(EntryKind::Write, payload)
    }

    /// Submit a volume deletion, ordered behind every prior write.
    pub fn delete_volume(&mut self, volume: &str) -> Result<LogIndex, LogError> {
        let payload = postcard::to_allocvec(&VolumeDelete { volume: String::from(volume) })
            .map_err(|_| LogError::BadMessage)?;
        self.log.submit(EntryKind::DeleteVolume, payload)
    }

    /// Local read, bypassing the log. Follower reads may trail the leader.
    pub fn read(&mut self, volume: &str, offset: u64, buf: &mut [u8]) -> Result<(), PoolError> {
        let mut pool = self.pool.lock();
        let id = pool.find_volume(volume).map(|v| v.id).ok_or(PoolError::NotFound)?;
        pool.volume_read(id, offset, buf)
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.log.tick(now_ms);
    }

    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        self.log.receive(bytes)
    }
}
