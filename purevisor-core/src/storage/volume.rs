//! Volumes over the extent pool

use alloc::string::String;
use alloc::vec::Vec;

use crate::storage::pool::ExtentId;
use crate::uuid::Uuid;

/// Identifies a volume within one pool.
pub type VolumeId = u32;

/// How many copies of each extent the pool keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    None,
    /// One replica (two copies total).
    Mirror,
    /// Two replicas (three copies total).
    Triple,
    /// Erasure coding; accepted as a mode name, not yet implemented.
    Erasure,
}

impl ReplicationMode {
    /// Replica extents per primary, when the mode is supported.
    pub fn replica_count(self) -> Option<usize> {
        match self {
            ReplicationMode::None => Some(0),
            ReplicationMode::Mirror => Some(1),
            ReplicationMode::Triple => Some(2),
            ReplicationMode::Erasure => None,
        }
    }
}

/// A sized, named mapping from volume extent index to pool extent id.
/// Unmapped (zero) entries are the thin-provisioning holes.
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub uuid: Uuid,
    /// Logical size in bytes.
    pub size: u64,
    pub thin: bool,
    pub mode: ReplicationMode,
    pub extent_map: Vec<ExtentId>,
    /// Source volume when this is a snapshot.
    pub parent: Option<VolumeId>,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl Volume {
    /// Mapped (allocated) extents in this volume.
    pub fn allocated_extents(&self) -> usize {
        self.extent_map.iter().filter(|&&id| id != 0).count()
    }

    pub fn extent_count(&self) -> usize {
        self.extent_map.len()
    }
}
