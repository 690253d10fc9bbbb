//! Virtual machine aggregate
//!
//! A VM owns its guest-physical memory arena, the nested translation table
//! shared by all VCPUs, up to 256 VCPUs, the legacy I/O bus carrying its
//! virtio devices, and per-VM exit statistics. Lifecycle transitions are
//! validated here; `Error` is terminal until the VM is destroyed.

use alloc::string::String;
use alloc::vec::Vec;

use purevisor_hal::memory::{FrameAllocator, HostMap, MemoryFlags, PhysicalAddress, PAGE_SIZE};

use crate::gpt::{CacheType, Gpt};
use crate::uuid::Uuid;
use crate::vcpu::{Vcpu, VcpuId, VmId};
use crate::virtio::LegacyIoBus;

/// Upper bound on VCPUs per VM.
pub const MAX_VCPUS: usize = 256;

/// VM lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Migrating,
    Error,
}

impl VmPhase {
    /// Legal phase transitions.
    pub fn can_transition_to(self, to: VmPhase) -> bool {
        use VmPhase::*;
        match (self, to) {
            (_, Error) => true,
            (Created, Starting) => true,
            (Starting, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Stopping) | (Paused, Stopping) => true,
            (Stopping, Stopped) => true,
            (Stopped, Starting) => true,
            (Running, Migrating) => true,
            (Migrating, Running) | (Migrating, Stopped) => true,
            _ => false,
        }
    }
}

/// VM subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    InvalidTransition { from: VmPhase, to: VmPhase },
    TooManyVcpus,
    /// Guest-physical access outside the arena.
    BadAddress,
    NotFound,
    OutOfMemory,
    /// An exit the core cannot service.
    GuestFault,
}

/// The guest-physical memory arena.
///
/// Host access goes through the identity window, so arena offsets double
/// as guest-physical addresses. Bounds are checked on every access; the
/// virtqueue runtime relies on that to contain misbehaving guests.
pub struct GuestRam {
    base: *mut u8,
    size: usize,
}

// SAFETY: concurrent access to guest memory is synchronized by the ring
// protocols layered above (acquire/release fences around index updates).
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Allocate a zeroed arena of `size` bytes (page-granular).
    pub fn new(size: usize) -> Result<Self, VmError> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(VmError::BadAddress);
        }
        let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE).map_err(|_| VmError::BadAddress)?;
        // SAFETY: non-zero, page-aligned layout.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(VmError::OutOfMemory);
        }
        Ok(GuestRam { base, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host-physical address of the arena start (identity window).
    pub fn host_base(&self) -> PhysicalAddress {
        self.base as PhysicalAddress
    }

    /// Host pointer for `len` bytes at guest-physical `gpa`.
    pub fn host_ptr(&self, gpa: u64, len: usize) -> Option<*mut u8> {
        let end = gpa.checked_add(len as u64)?;
        if end > self.size as u64 {
            return None;
        }
        // SAFETY: bounds just checked against the allocation.
        Some(unsafe { self.base.add(gpa as usize) })
    }

    pub fn read(&self, gpa: u64, out: &mut [u8]) -> Result<(), VmError> {
        let src = self.host_ptr(gpa, out.len()).ok_or(VmError::BadAddress)?;
        // SAFETY: src spans out.len() bytes inside the arena.
        unsafe { core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<(), VmError> {
        let dst = self.host_ptr(gpa, data.len()).ok_or(VmError::BadAddress)?;
        // SAFETY: dst spans data.len() bytes inside the arena.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    /// Volatile typed read; `gpa` must be naturally aligned for `T`.
    pub fn read_obj<T: Copy>(&self, gpa: u64) -> Result<T, VmError> {
        let ptr = self.host_ptr(gpa, core::mem::size_of::<T>()).ok_or(VmError::BadAddress)?;
        debug_assert_eq!(gpa as usize % core::mem::align_of::<T>(), 0);
        // SAFETY: bounds checked; alignment guaranteed by the ring layout.
        Ok(unsafe { core::ptr::read_volatile(ptr as *const T) })
    }

    /// Volatile typed write; `gpa` must be naturally aligned for `T`.
    pub fn write_obj<T: Copy>(&self, gpa: u64, value: T) -> Result<(), VmError> {
        let ptr = self.host_ptr(gpa, core::mem::size_of::<T>()).ok_or(VmError::BadAddress)?;
        debug_assert_eq!(gpa as usize % core::mem::align_of::<T>(), 0);
        // SAFETY: as in read_obj.
        unsafe { core::ptr::write_volatile(ptr as *mut T, value) };
        Ok(())
    }
}

impl Drop for GuestRam {
    fn drop(&mut self) {
        let layout = core::alloc::Layout::from_size_align(self.size, PAGE_SIZE).expect("arena layout");
        // SAFETY: base/layout match the original allocation.
        unsafe { alloc::alloc::dealloc(self.base, layout) };
    }
}

/// Per-VM exit accounting.
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub total_exits: u64,
    pub exit_counts: [u64; 64],
    pub total_exit_cycles: u64,
}

impl Default for VmStats {
    fn default() -> Self {
        Self {
            total_exits: 0,
            exit_counts: [0; 64],
            total_exit_cycles: 0,
        }
    }
}

impl VmStats {
    pub fn record_exit(&mut self, reason_index: usize, latency_cycles: u64) {
        self.total_exits += 1;
        self.total_exit_cycles = self.total_exit_cycles.wrapping_add(latency_cycles);
        if reason_index < self.exit_counts.len() {
            self.exit_counts[reason_index] += 1;
        }
    }
}

/// One virtual machine.
pub struct Vm {
    pub id: VmId,
    pub name: String,
    pub uuid: Uuid,
    pub phase: VmPhase,
    pub ram: GuestRam,
    pub gpt: Gpt,
    pub vcpus: Vec<Vcpu>,
    pub bus: LegacyIoBus,
    pub stats: VmStats,
    /// Destination node recorded while Migrating.
    pub migration_target: Option<u32>,
    map: HostMap,
}

impl Vm {
    /// Create the arena and translation table and identity-map guest RAM.
    pub fn new(
        id: VmId,
        name: String,
        uuid: Uuid,
        memory_size: usize,
        alloc: &mut dyn FrameAllocator,
        map: HostMap,
    ) -> Result<Self, VmError> {
        let ram = GuestRam::new(memory_size)?;
        let mut gpt = Gpt::new(alloc, map).map_err(|_| VmError::OutOfMemory)?;
        if let Err(err) = gpt.map_range(
            alloc,
            0,
            ram.host_base(),
            memory_size as u64,
            MemoryFlags::RWX,
            CacheType::WriteBack,
        ) {
            log_error!("vm {}: guest RAM mapping failed {:?}", id, err);
            gpt.destroy(alloc);
            return Err(VmError::OutOfMemory);
        }
        Ok(Vm {
            id,
            name,
            uuid,
            phase: VmPhase::Created,
            ram,
            gpt,
            vcpus: Vec::new(),
            bus: LegacyIoBus::new(),
            stats: VmStats::default(),
            migration_target: None,
            map,
        })
    }

    /// Add a VCPU. Only legal before the VM first starts; the shared GPT
    /// must not change under a running VCPU.
    pub fn add_vcpu(&mut self, alloc: &mut dyn FrameAllocator) -> Result<VcpuId, VmError> {
        if self.phase != VmPhase::Created && self.phase != VmPhase::Stopped {
            return Err(VmError::InvalidTransition { from: self.phase, to: self.phase });
        }
        if self.vcpus.len() >= MAX_VCPUS {
            return Err(VmError::TooManyVcpus);
        }
        let id = self.vcpus.len() as VcpuId;
        let vcpu = Vcpu::new(id, alloc, self.map).map_err(|_| VmError::OutOfMemory)?;
        self.vcpus.push(vcpu);
        Ok(id)
    }

    /// Validated phase change.
    pub fn set_phase(&mut self, to: VmPhase) -> Result<(), VmError> {
        if !self.phase.can_transition_to(to) {
            return Err(VmError::InvalidTransition { from: self.phase, to });
        }
        self.phase = to;
        Ok(())
    }

    /// Tear down the VM, releasing table and VCPU frames.
    pub fn destroy(mut self, alloc: &mut dyn FrameAllocator) {
        for vcpu in self.vcpus.drain(..) {
            vcpu.destroy(alloc);
        }
        self.gpt.destroy(alloc);
    }
}
