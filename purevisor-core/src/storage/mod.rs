//! Pooled block storage
//!
//! Local block devices are partitioned into fixed-size extents and pooled;
//! thin and thick volumes map volume-extent indices onto pool extents,
//! optionally with synchronous replication across distinct devices. The
//! replicated log in `cluster` layers cross-node ordering on top of this.

pub mod pool;
pub mod volume;

pub use pool::{ExtentId, ExtentPool, ExtentState, PoolStatus, MAX_POOL_DEVICES};
pub use volume::{ReplicationMode, Volume, VolumeId};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use purevisor_hal::storage::{BlockDevice, BlockDeviceInfo, BlockError, BlockRequest};

/// Storage subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    OutOfSpace,
    /// Replicas cannot be placed on distinct devices.
    RedundancyImpossible,
    NotFound,
    InvalidState,
    BadArgument,
    IoFailed,
}

impl From<BlockError> for PoolError {
    fn from(_: BlockError) -> Self {
        PoolError::IoFailed
    }
}

/// Block-device view of one pool volume.
///
/// This is the storage callback a hyperconverged node hands to its virtio
/// block back-end: guest sectors land in pooled, possibly replicated,
/// extents.
pub struct PoolVolumeDevice {
    pool: Arc<Mutex<ExtentPool>>,
    volume: VolumeId,
}

impl PoolVolumeDevice {
    pub fn new(pool: Arc<Mutex<ExtentPool>>, volume: VolumeId) -> Self {
        PoolVolumeDevice { pool, volume }
    }
}

impl BlockDevice for PoolVolumeDevice {
    fn submit(&mut self, req: BlockRequest<'_>) -> Result<usize, BlockError> {
        let mut pool = self.pool.lock();
        match req {
            BlockRequest::Read { offset, buf } => {
                let n = buf.len();
                pool.volume_read(self.volume, offset, buf).map_err(|_| BlockError::IoFailed)?;
                Ok(n)
            }
            BlockRequest::Write { offset, buf } => {
                pool.volume_write(self.volume, offset, buf).map_err(|_| BlockError::IoFailed)?;
                Ok(buf.len())
            }
            BlockRequest::Discard { offset, len } | BlockRequest::WriteZeroes { offset, len } => {
                pool.volume_zero(self.volume, offset, len).map_err(|_| BlockError::IoFailed)?;
                Ok(len as usize)
            }
        }
    }

    fn flush(&mut self) -> Result<(), BlockError> {
        self.pool.lock().volume_flush(self.volume).map_err(|_| BlockError::IoFailed)
    }

    fn info(&self) -> BlockDeviceInfo {
        let pool = self.pool.lock();
        let capacity = pool.volume(self.volume).map_or(0, |v| v.size);
        BlockDeviceInfo { capacity, block_size: 512, durable: true }
    }
}

/// Memory-backed block device.
///
/// Backs extents where no physical disk is attached and carries the whole
/// hosted test suite.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(capacity: usize) -> Self {
        RamDisk { data: vec![0; capacity] }
    }

    fn range(&self, offset: u64, len: usize) -> Result<core::ops::Range<usize>, BlockError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(BlockError::OutOfRange)?;
        if end > self.data.len() {
            return Err(BlockError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn submit(&mut self, req: BlockRequest<'_>) -> Result<usize, BlockError> {
        match req {
            BlockRequest::Read { offset, buf } => {
                let r = self.range(offset, buf.len())?;
                buf.copy_from_slice(&self.data[r]);
                Ok(buf.len())
            }
            BlockRequest::Write { offset, buf } => {
                let r = self.range(offset, buf.len())?;
                self.data[r].copy_from_slice(buf);
                Ok(buf.len())
            }
            BlockRequest::Discard { offset, len } | BlockRequest::WriteZeroes { offset, len } => {
                let r = self.range(offset, len as usize)?;
                self.data[r].fill(0);
                Ok(len as usize)
            }
        }
    }

    fn flush(&mut self) -> Result<(), BlockError> {
        Ok(())
    }

    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo { capacity: self.data.len() as u64, block_size: 512, durable: false }
    }
}
