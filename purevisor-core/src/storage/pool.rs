//! Extent pool
//!
//! Up to 16 block devices partitioned into fixed-size extents. Extents are
//! Free, Allocated (owned by exactly one volume) or Reserved
//! (snapshot-shared between volumes, copy-on-write on the next write).
//! Replica extents of one primary always live on distinct devices;
//! allocation fails rather than colocate copies.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use heapless::Vec as BoundedVec;

use purevisor_hal::storage::{BlockDevice, BlockRequest, DeviceId};

use crate::storage::volume::{ReplicationMode, Volume, VolumeId};
use crate::storage::PoolError;
use crate::uuid::{Rng64, Uuid};

/// Devices one pool may aggregate.
pub const MAX_POOL_DEVICES: usize = 16;

/// Identifies an extent within one pool. Zero never names an extent; it is
/// the unmapped marker in volume extent maps.
pub type ExtentId = u32;

/// Extent allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    Free,
    Allocated,
    /// Shared by more than one volume map (snapshots); writes copy first.
    Reserved,
}

/// Pool availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// No devices; all volume I/O fails.
    Offline,
    Online,
    /// Serving, but a device reported errors.
    Degraded,
}

struct Extent {
    state: ExtentState,
    device: DeviceId,
    dev_offset: u64,
    /// Owning volume while Allocated; `None` while Free or shared.
    volume: Option<VolumeId>,
    /// Replica extents backing this primary.
    replicas: BoundedVec<ExtentId, 2>,
    /// Volume maps pointing at this extent (snapshot sharing).
    refs: u16,
}

struct PoolDevice {
    dev: Box<dyn BlockDevice + Send>,
    extent_count: usize,
}

/// A pooled set of block devices and the volumes carved from them.
pub struct ExtentPool {
    pub name: String,
    pub uuid: Uuid,
    extent_size: u64,
    status: PoolStatus,
    devices: BTreeMap<DeviceId, PoolDevice>,
    next_device: DeviceId,
    extents: BTreeMap<ExtentId, Extent>,
    next_extent: ExtentId,
    free_count: usize,
    volumes: BTreeMap<VolumeId, Volume>,
    next_volume: VolumeId,
    pub read_bytes: u64,
    pub write_bytes: u64,
    rng: Rng64,
}

impl ExtentPool {
    /// Pool sized by the recognized configuration options.
    pub fn with_config(name: &str, cfg: &crate::config::CoreConfig, seed: u64) -> Self {
        Self::new(name, cfg.extent_size, seed)
    }

    pub fn new(name: &str, extent_size: u64, seed: u64) -> Self {
        let mut rng = Rng64::new(seed);
        let uuid = Uuid::new_v4(&mut rng);
        ExtentPool {
            name: String::from(name),
            uuid,
            extent_size,
            status: PoolStatus::Offline,
            devices: BTreeMap::new(),
            next_device: 0,
            extents: BTreeMap::new(),
            next_extent: 1,
            free_count: 0,
            volumes: BTreeMap::new(),
            next_volume: 1,
            read_bytes: 0,
            write_bytes: 0,
            rng,
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    pub fn total_extents(&self) -> usize {
        self.extents.len()
    }

    pub fn free_extents(&self) -> usize {
        self.free_count
    }

    pub fn extents_in_state(&self, state: ExtentState) -> usize {
        self.extents.values().filter(|e| e.state == state).count()
    }

    pub fn volume(&self, id: VolumeId) -> Option<&Volume> {
        self.volumes.get(&id)
    }

    pub fn find_volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.values().find(|v| v.name == name)
    }

    pub fn volume_ids(&self) -> impl Iterator<Item = VolumeId> + '_ {
        self.volumes.keys().copied()
    }

    /// Extent state probe for invariant checks.
    pub fn extent_state(&self, id: ExtentId) -> Option<ExtentState> {
        self.extents.get(&id).map(|e| e.state)
    }

    /// Add a device; each contributes `capacity / extent_size` extents and
    /// the first device brings the pool Online.
    pub fn add_device(&mut self, mut dev: Box<dyn BlockDevice + Send>) -> Result<DeviceId, PoolError> {
        if self.devices.len() >= MAX_POOL_DEVICES {
            return Err(PoolError::BadArgument);
        }
        let count = (dev.info().capacity / self.extent_size) as usize;
        if count == 0 {
            return Err(PoolError::BadArgument);
        }
        dev.open()?;
        let id = self.next_device;
        self.next_device += 1;
        for i in 0..count {
            let extent_id = self.next_extent;
            self.next_extent += 1;
            self.extents.insert(
                extent_id,
                Extent {
                    state: ExtentState::Free,
                    device: id,
                    dev_offset: i as u64 * self.extent_size,
                    volume: None,
                    replicas: BoundedVec::new(),
                    refs: 0,
                },
            );
        }
        self.free_count += count;
        self.devices.insert(id, PoolDevice { dev, extent_count: count });
        if self.status == PoolStatus::Offline {
            self.status = PoolStatus::Online;
        }
        Ok(id)
    }

    /// Remove a device. Legal only while every extent on it is Free.
    pub fn remove_device(&mut self, id: DeviceId) -> Result<(), PoolError> {
        let device = self.devices.get(&id).ok_or(PoolError::NotFound)?;
        if self.extents.values().any(|e| e.device == id && e.state != ExtentState::Free) {
            return Err(PoolError::InvalidState);
        }
        let removed = device.extent_count;
        self.extents.retain(|_, e| e.device != id);
        self.free_count -= removed;
        if let Some(mut device) = self.devices.remove(&id) {
            device.dev.close();
        }
        if self.devices.is_empty() {
            self.status = PoolStatus::Offline;
        }
        Ok(())
    }

    /// Create a volume. Thick volumes allocate every extent eagerly and
    /// roll the allocations back on failure.
    pub fn create_volume(
        &mut self,
        name: &str,
        size: u64,
        mode: ReplicationMode,
        thin: bool,
    ) -> Result<VolumeId, PoolError> {
        if self.status == PoolStatus::Offline {
            return Err(PoolError::InvalidState);
        }
        if size == 0 || self.find_volume(name).is_some() {
            return Err(PoolError::BadArgument);
        }
        if mode.replica_count().is_none() {
            return Err(PoolError::RedundancyImpossible);
        }
        let extent_count = size.div_ceil(self.extent_size) as usize;
        let id = self.next_volume;
        self.next_volume += 1;
        let uuid = Uuid::new_v4(&mut self.rng);
        let mut volume = Volume {
            id,
            name: String::from(name),
            uuid,
            size,
            thin,
            mode,
            extent_map: vec![0; extent_count],
            parent: None,
            read_bytes: 0,
            write_bytes: 0,
        };
        if !thin {
            for index in 0..extent_count {
                match self.allocate_extent(id, mode) {
                    Ok(extent) => volume.extent_map[index] = extent,
                    Err(err) => {
                        for &extent in volume.extent_map.iter().filter(|&&e| e != 0) {
                            self.release_extent(extent);
                        }
                        return Err(err);
                    }
                }
            }
        }
        self.volumes.insert(id, volume);
        Ok(id)
    }

    /// Delete a volume and release its extent references.
    pub fn delete_volume(&mut self, id: VolumeId) -> Result<(), PoolError> {
        let volume = self.volumes.remove(&id).ok_or(PoolError::NotFound)?;
        for extent in volume.extent_map.into_iter().filter(|&e| e != 0) {
            self.release_extent(extent);
        }
        Ok(())
    }

    /// Grow a volume; shrinking is rejected.
    pub fn resize_volume(&mut self, id: VolumeId, new_size: u64) -> Result<(), PoolError> {
        let extent_size = self.extent_size;
        let volume = self.volumes.get_mut(&id).ok_or(PoolError::NotFound)?;
        if new_size < volume.size {
            return Err(PoolError::BadArgument);
        }
        let new_count = new_size.div_ceil(extent_size) as usize;
        let old_count = volume.extent_map.len();
        let thin = volume.thin;
        let mode = volume.mode;
        volume.size = new_size;
        volume.extent_map.resize(new_count, 0);
        if !thin {
            for index in old_count..new_count {
                let extent = self.allocate_extent(id, mode)?;
                if let Some(volume) = self.volumes.get_mut(&id) {
                    volume.extent_map[index] = extent;
                }
            }
        }
        Ok(())
    }

    /// Snapshot: a new thin volume sharing the source's mapped extents.
    /// Shared extents turn Reserved; the next write to either side copies.
    pub fn snapshot_volume(&mut self, source: VolumeId, name: &str) -> Result<VolumeId, PoolError> {
        if self.find_volume(name).is_some() {
            return Err(PoolError::BadArgument);
        }
        let src = self.volumes.get(&source).ok_or(PoolError::NotFound)?;
        let map = src.extent_map.clone();
        let (size, mode) = (src.size, src.mode);
        let id = self.next_volume;
        self.next_volume += 1;
        let uuid = Uuid::new_v4(&mut self.rng);
        for &extent in map.iter().filter(|&&e| e != 0) {
            if let Some(e) = self.extents.get_mut(&extent) {
                e.refs += 1;
                e.state = ExtentState::Reserved;
                e.volume = None;
            }
        }
        self.volumes.insert(
            id,
            Volume {
                id,
                name: String::from(name),
                uuid,
                size,
                thin: true,
                mode,
                extent_map: map,
                parent: Some(source),
                read_bytes: 0,
                write_bytes: 0,
            },
        );
        Ok(id)
    }

    /// Volume read. Unmapped extents read as zeros.
    pub fn volume_read(&mut self, id: VolumeId, offset: u64, buf: &mut [u8]) -> Result<(), PoolError> {
        self.check_serving()?;
        let extent_size = self.extent_size;
        let mut pos = 0usize;
        while pos < buf.len() {
            let logical = offset + pos as u64;
            let (index, intra) = ((logical / extent_size) as usize, logical % extent_size);
            let n = core::cmp::min((extent_size - intra) as usize, buf.len() - pos);
            let extent = self.mapped_extent(id, index)?;
            match extent {
                0 => buf[pos..pos + n].fill(0),
                extent => {
                    let (device, dev_offset) = self.extent_location(extent)?;
                    self.device_io(device, |dev| {
                        dev.submit(BlockRequest::Read { offset: dev_offset + intra, buf: &mut buf[pos..pos + n] })
                    })?;
                }
            }
            pos += n;
        }
        self.read_bytes += buf.len() as u64;
        if let Some(volume) = self.volumes.get_mut(&id) {
            volume.read_bytes += buf.len() as u64;
        }
        Ok(())
    }

    /// Volume write. Allocates on demand for thin volumes, copies shared
    /// extents first, and mirrors the write onto every replica extent.
    pub fn volume_write(&mut self, id: VolumeId, offset: u64, data: &[u8]) -> Result<(), PoolError> {
        self.check_serving()?;
        let extent_size = self.extent_size;
        let mut pos = 0usize;
        while pos < data.len() {
            let logical = offset + pos as u64;
            let (index, intra) = ((logical / extent_size) as usize, logical % extent_size);
            let n = core::cmp::min((extent_size - intra) as usize, data.len() - pos);
            let extent = self.writable_extent(id, index)?;
            let (device, dev_offset) = self.extent_location(extent)?;
            self.device_io(device, |dev| {
                dev.submit(BlockRequest::Write { offset: dev_offset + intra, buf: &data[pos..pos + n] })
            })?;
            let replicas = self.extent_replicas(extent);
            for replica in replicas {
                let (rdev, roff) = self.extent_location(replica)?;
                self.device_io(rdev, |dev| {
                    dev.submit(BlockRequest::Write { offset: roff + intra, buf: &data[pos..pos + n] })
                })?;
            }
            pos += n;
        }
        self.write_bytes += data.len() as u64;
        if let Some(volume) = self.volumes.get_mut(&id) {
            volume.write_bytes += data.len() as u64;
        }
        Ok(())
    }

    /// Zero a range. Unmapped extents stay unmapped.
    pub fn volume_zero(&mut self, id: VolumeId, offset: u64, len: u64) -> Result<(), PoolError> {
        self.check_serving()?;
        let extent_size = self.extent_size;
        let mut pos = 0u64;
        while pos < len {
            let logical = offset + pos;
            let (index, intra) = ((logical / extent_size) as usize, logical % extent_size);
            let n = core::cmp::min(extent_size - intra, len - pos);
            let extent = self.mapped_extent(id, index)?;
            if extent != 0 {
                // Zeroing is a write: shared extents still copy first.
                let extent = self.writable_extent(id, index)?;
                let (device, dev_offset) = self.extent_location(extent)?;
                self.device_io(device, |dev| {
                    dev.submit(BlockRequest::WriteZeroes { offset: dev_offset + intra, len: n })
                })?;
                for replica in self.extent_replicas(extent) {
                    let (rdev, roff) = self.extent_location(replica)?;
                    self.device_io(rdev, |dev| {
                        dev.submit(BlockRequest::WriteZeroes { offset: roff + intra, len: n })
                    })?;
                }
            }
            pos += n;
        }
        Ok(())
    }

    /// Flush every device backing the volume's mapped extents.
    pub fn volume_flush(&mut self, id: VolumeId) -> Result<(), PoolError> {
        self.check_serving()?;
        let volume = self.volumes.get(&id).ok_or(PoolError::NotFound)?;
        let mut touched: Vec<DeviceId> = Vec::new();
        for &extent in volume.extent_map.iter().filter(|&&e| e != 0) {
            if let Some(e) = self.extents.get(&extent) {
                if !touched.contains(&e.device) {
                    touched.push(e.device);
                }
                for &replica in e.replicas.iter() {
                    if let Some(r) = self.extents.get(&replica) {
                        if !touched.contains(&r.device) {
                            touched.push(r.device);
                        }
                    }
                }
            }
        }
        for device in touched {
            self.device_io(device, |dev| dev.flush().map(|_| 0))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Extent management
    // ------------------------------------------------------------------

    /// Allocate one primary extent plus the replicas its mode requires,
    /// each on a distinct device. Rolls back on failure.
    fn allocate_extent(&mut self, owner: VolumeId, mode: ReplicationMode) -> Result<ExtentId, PoolError> {
        let replica_count = mode.replica_count().ok_or(PoolError::RedundancyImpossible)?;
        let mut used_devices: Vec<DeviceId> = Vec::new();
        let mut picked: Vec<ExtentId> = Vec::new();

        for copy in 0..=replica_count {
            match self.pick_free_extent(&used_devices) {
                Some((extent, device)) => {
                    used_devices.push(device);
                    picked.push(extent);
                }
                // Nothing is marked until every copy is placed, so failing
                // here leaves the pool untouched. No primary means the pool
                // is full; a missing replica means redundancy cannot be met.
                None if copy == 0 => return Err(PoolError::OutOfSpace),
                None => return Err(PoolError::RedundancyImpossible),
            }
        }

        let primary = picked[0];
        for &extent in &picked {
            if let Some(e) = self.extents.get_mut(&extent) {
                e.state = ExtentState::Allocated;
                e.volume = Some(owner);
                e.refs = 1;
            }
            self.free_count -= 1;
        }
        let replicas = picked[1..].iter().copied().collect::<BoundedVec<ExtentId, 2>>();
        if let Some(e) = self.extents.get_mut(&primary) {
            e.replicas = replicas;
        }
        Ok(primary)
    }

    /// A free extent on any device not yet in `exclude`, preferring the
    /// device with the most free extents.
    fn pick_free_extent(&self, exclude: &[DeviceId]) -> Option<(ExtentId, DeviceId)> {
        let mut best: Option<(DeviceId, usize)> = None;
        for &device in self.devices.keys() {
            if exclude.contains(&device) {
                continue;
            }
            let free = self
                .extents
                .values()
                .filter(|e| e.device == device && e.state == ExtentState::Free)
                .count();
            if free > 0 && best.map_or(true, |(_, b)| free > b) {
                best = Some((device, free));
            }
        }
        let (device, _) = best?;
        self.extents
            .iter()
            .find(|(_, e)| e.device == device && e.state == ExtentState::Free)
            .map(|(&id, e)| (id, e.device))
    }

    /// Drop one reference to an extent; frees it (and its replicas) when
    /// the last reference goes.
    fn release_extent(&mut self, id: ExtentId) {
        let (refs, replicas) = match self.extents.get_mut(&id) {
            Some(e) => {
                e.refs = e.refs.saturating_sub(1);
                (e.refs, e.replicas.clone())
            }
            None => return,
        };
        if refs == 0 {
            if let Some(e) = self.extents.get_mut(&id) {
                e.state = ExtentState::Free;
                e.volume = None;
                e.replicas.clear();
            }
            self.free_count += 1;
            for replica in replicas {
                if let Some(e) = self.extents.get_mut(&replica) {
                    e.state = ExtentState::Free;
                    e.volume = None;
                    e.refs = 0;
                }
                self.free_count += 1;
            }
        } else if refs == 1 {
            self.reassign_owner(id);
        }
    }

    /// After sharing drops back to one reference, the surviving volume
    /// becomes the plain owner again.
    fn reassign_owner(&mut self, id: ExtentId) {
        let owner = self
            .volumes
            .values()
            .find(|v| v.extent_map.contains(&id))
            .map(|v| v.id);
        if let Some(e) = self.extents.get_mut(&id) {
            e.state = ExtentState::Allocated;
            e.volume = owner;
        }
    }

    /// Map lookup for reads: zero means "unallocated, reads as zeros".
    fn mapped_extent(&self, id: VolumeId, index: usize) -> Result<ExtentId, PoolError> {
        let volume = self.volumes.get(&id).ok_or(PoolError::NotFound)?;
        volume.extent_map.get(index).copied().ok_or(PoolError::BadArgument)
    }

    /// Map lookup for writes: allocates on demand and resolves sharing
    /// with a copy before returning a privately owned extent.
    fn writable_extent(&mut self, id: VolumeId, index: usize) -> Result<ExtentId, PoolError> {
        let current = self.mapped_extent(id, index)?;
        let mode = self.volumes.get(&id).map(|v| v.mode).ok_or(PoolError::NotFound)?;
        if current == 0 {
            let extent = self.allocate_extent(id, mode)?;
            if let Some(volume) = self.volumes.get_mut(&id) {
                volume.extent_map[index] = extent;
            }
            return Ok(extent);
        }
        let shared = self
            .extents
            .get(&current)
            .map(|e| e.refs > 1)
            .ok_or(PoolError::IoFailed)?;
        if !shared {
            return Ok(current);
        }
        // Copy-on-write: private copy first, then retarget this volume.
        let fresh = self.allocate_extent(id, mode)?;
        let extent_size = self.extent_size as usize;
        let (src_dev, src_off) = self.extent_location(current)?;
        let (dst_dev, dst_off) = self.extent_location(fresh)?;
        let mut content = vec![0u8; extent_size];
        self.device_io(src_dev, |dev| {
            dev.submit(BlockRequest::Read { offset: src_off, buf: &mut content })
        })?;
        self.device_io(dst_dev, |dev| {
            dev.submit(BlockRequest::Write { offset: dst_off, buf: &content })
        })?;
        for replica in self.extent_replicas(fresh) {
            let (rdev, roff) = self.extent_location(replica)?;
            self.device_io(rdev, |dev| {
                dev.submit(BlockRequest::Write { offset: roff, buf: &content })
            })?;
        }
        if let Some(volume) = self.volumes.get_mut(&id) {
            volume.extent_map[index] = fresh;
        }
        self.release_extent(current);
        Ok(fresh)
    }

    fn extent_location(&self, id: ExtentId) -> Result<(DeviceId, u64), PoolError> {
        self.extents
            .get(&id)
            .map(|e| (e.device, e.dev_offset))
            .ok_or(PoolError::IoFailed)
    }

    fn extent_replicas(&self, id: ExtentId) -> BoundedVec<ExtentId, 2> {
        self.extents.get(&id).map(|e| e.replicas.clone()).unwrap_or_default()
    }

    fn device_io<R>(
        &mut self,
        id: DeviceId,
        f: impl FnOnce(&mut dyn BlockDevice) -> Result<R, purevisor_hal::storage::BlockError>,
    ) -> Result<R, PoolError> {
        let device = self.devices.get_mut(&id).ok_or(PoolError::IoFailed)?;
        match f(device.dev.as_mut()) {
            Ok(r) => Ok(r),
            Err(err) => {
                log_error!("pool {}: device {} I/O failed {:?}", self.name, id, err);
                self.status = PoolStatus::Degraded;
                Err(PoolError::IoFailed)
            }
        }
    }

    fn check_serving(&self) -> Result<(), PoolError> {
        if self.status == PoolStatus::Offline {
            return Err(PoolError::IoFailed);
        }
        Ok(())
    }
}
