//! Virtqueue runtime
//!
//! The split-ring protocol between a guest driver and a host back-end:
//! a descriptor table, an available ring produced by the guest and a used
//! ring produced by the host, all living in guest memory and addressed
//! through the VM's arena. The host keeps shadow indices for both rings.
//!
//! Ordering rules enforced here: the available index is read with an
//! acquire fence before any descriptor is trusted; payload writes into
//! guest buffers happen before the used-ring element is written; a release
//! fence orders the element ahead of the used-index increment.

use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{fence, Ordering};
use static_assertions::const_assert_eq;

use purevisor_hal::memory::PAGE_SIZE;

use crate::vm::GuestRam;

/// Largest ring size the device model accepts.
pub const MAX_QUEUE_SIZE: u16 = 256;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Chain continues at `next`.
        const NEXT = 1 << 0;
        /// Device-writable buffer.
        const WRITE = 1 << 1;
        /// Indirect descriptor table (not negotiated by this device model).
        const INDIRECT = 1 << 2;
    }
}

/// Guest flag suppressing used-ring interrupts.
const AVAIL_F_NO_INTERRUPT: u16 = 1;

/// One descriptor-table entry, exactly as it sits in guest memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

const_assert_eq!(core::mem::size_of::<VirtqDesc>(), 16);

/// One used-ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

const_assert_eq!(core::mem::size_of::<UsedElem>(), 8);

/// Virtqueue protocol violations by the guest. Any of these marks the
/// device as needing reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqueueError {
    /// Descriptor index outside the table.
    BadIndex,
    /// Descriptor chain longer than the table (a cycle).
    CyclicChain,
    /// A ring or descriptor points outside guest memory.
    BadAddress,
    /// INDIRECT descriptors were not negotiated.
    UnsupportedIndirect,
    /// Queue accessed before it was configured.
    NotReady,
}

/// A popped descriptor chain, head first.
#[derive(Debug, Clone)]
pub struct DescChain {
    pub head: u16,
    pub descs: Vec<VirtqDesc>,
}

impl DescChain {
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Device-readable descriptors, in chain order.
    pub fn readable(&self) -> impl Iterator<Item = &VirtqDesc> {
        self.descs.iter().filter(|d| d.flags & DescFlags::WRITE.bits() == 0)
    }

    /// Device-writable descriptors, in chain order.
    pub fn writable(&self) -> impl Iterator<Item = &VirtqDesc> {
        self.descs.iter().filter(|d| d.flags & DescFlags::WRITE.bits() != 0)
    }

    /// Upper bound on bytes the host may write into this chain.
    pub fn write_capacity(&self) -> u64 {
        self.writable().map(|d| d.len as u64).sum()
    }
}

/// Host-side state of one virtqueue.
#[derive(Debug, Clone)]
pub struct Virtqueue {
    size: u16,
    ready: bool,
    event_idx: bool,
    desc_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
    /// Page-frame number the guest programmed, for register readback.
    pfn: u32,
    /// Next available-ring slot to consume.
    last_avail: u16,
    /// Shadow of the published used index.
    used_idx: u16,
    /// Used index at the last delivered notification.
    signalled_used: u16,
}

impl Virtqueue {
    pub const fn disabled() -> Self {
        Virtqueue {
            size: 0,
            ready: false,
            event_idx: false,
            desc_gpa: 0,
            avail_gpa: 0,
            used_gpa: 0,
            pfn: 0,
            last_avail: 0,
            used_idx: 0,
            signalled_used: 0,
        }
    }

    /// Configure from an explicit ring triple.
    pub fn configure(&mut self, size: u16, desc: u64, avail: u64, used: u64) {
        debug_assert!(size.is_power_of_two() && size <= MAX_QUEUE_SIZE);
        self.size = size;
        self.desc_gpa = desc;
        self.avail_gpa = avail;
        self.used_gpa = used;
        self.last_avail = 0;
        self.used_idx = 0;
        self.signalled_used = 0;
        self.ready = true;
    }

    /// Configure from a legacy queue-PFN write: descriptor table at the
    /// page, available ring right behind it, used ring on the next 4 KiB
    /// boundary.
    pub fn configure_legacy(&mut self, pfn: u32, size: u16) {
        if pfn == 0 {
            self.reset();
            return;
        }
        let base = (pfn as u64) << 12;
        let desc_bytes = 16 * size as u64;
        let avail_bytes = 6 + 2 * size as u64;
        let used = (base + desc_bytes + avail_bytes + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        self.configure(size, base, base + desc_bytes, used);
        self.pfn = pfn;
    }

    /// Disable the queue and clear its counters.
    pub fn reset(&mut self) {
        *self = Virtqueue { event_idx: self.event_idx, ..Virtqueue::disabled() };
    }

    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx = enabled;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn pfn(&self) -> u32 {
        if self.ready { self.pfn } else { 0 }
    }

    /// Shadow of the published used index, for introspection.
    pub fn last_used_index(&self) -> u16 {
        self.used_idx
    }

    /// Entries the guest has made available and the host has not consumed.
    pub fn queue_depth(&self, ram: &GuestRam) -> u16 {
        if !self.ready {
            return 0;
        }
        match ram.read_obj::<u16>(self.avail_gpa + 2) {
            Ok(avail_idx) => avail_idx.wrapping_sub(self.last_avail),
            Err(_) => 0,
        }
    }

    /// Take the next available descriptor chain, if any.
    pub fn pop(&mut self, ram: &GuestRam) -> Result<Option<DescChain>, VirtqueueError> {
        if !self.ready {
            return Err(VirtqueueError::NotReady);
        }
        let avail_idx = ram.read_obj::<u16>(self.avail_gpa + 2).map_err(|_| VirtqueueError::BadAddress)?;
        if avail_idx == self.last_avail {
            return Ok(None);
        }
        // Ring contents were published before the index; pair with the
        // guest's release.
        fence(Ordering::Acquire);
        let slot = self.avail_gpa + 4 + 2 * (self.last_avail % self.size) as u64;
        let head = ram.read_obj::<u16>(slot).map_err(|_| VirtqueueError::BadAddress)?;
        let chain = self.walk_chain(ram, head)?;
        self.last_avail = self.last_avail.wrapping_add(1);
        Ok(Some(chain))
    }

    /// Copy of the descriptor-table entry at `index`.
    pub fn descriptor(&self, ram: &GuestRam, index: u16) -> Result<VirtqDesc, VirtqueueError> {
        if !self.ready {
            return Err(VirtqueueError::NotReady);
        }
        if index >= self.size {
            return Err(VirtqueueError::BadIndex);
        }
        ram.read_obj::<VirtqDesc>(self.desc_gpa + 16 * index as u64)
            .map_err(|_| VirtqueueError::BadAddress)
    }

    /// Publish a completed chain: element first, release fence, then the
    /// index increment the guest polls.
    pub fn push(&mut self, ram: &GuestRam, head: u16, len: u32) -> Result<(), VirtqueueError> {
        if !self.ready {
            return Err(VirtqueueError::NotReady);
        }
        if head >= self.size {
            return Err(VirtqueueError::BadIndex);
        }
        let slot = self.used_gpa + 4 + 8 * (self.used_idx % self.size) as u64;
        ram.write_obj(slot, UsedElem { id: head as u32, len })
            .map_err(|_| VirtqueueError::BadAddress)?;
        fence(Ordering::Release);
        let next = self.used_idx.wrapping_add(1);
        ram.write_obj::<u16>(self.used_gpa + 2, next)
            .map_err(|_| VirtqueueError::BadAddress)?;
        self.used_idx = next;
        Ok(())
    }

    /// Whether the guest wants an interrupt for work pushed since the last
    /// delivered notification.
    pub fn should_notify(&mut self, ram: &GuestRam) -> bool {
        if !self.ready {
            return false;
        }
        fence(Ordering::SeqCst);
        if self.event_idx {
            let used_event_gpa = self.avail_gpa + 4 + 2 * self.size as u64;
            let event = match ram.read_obj::<u16>(used_event_gpa) {
                Ok(v) => v,
                Err(_) => return true,
            };
            let need = need_event(event, self.used_idx, self.signalled_used);
            if need {
                self.signalled_used = self.used_idx;
            }
            need
        } else {
            let flags = ram.read_obj::<u16>(self.avail_gpa).unwrap_or(0);
            flags & AVAIL_F_NO_INTERRUPT == 0
        }
    }

    fn walk_chain(&self, ram: &GuestRam, head: u16) -> Result<DescChain, VirtqueueError> {
        let mut descs = Vec::new();
        let mut index = head;
        loop {
            if descs.len() >= self.size as usize {
                return Err(VirtqueueError::CyclicChain);
            }
            let desc = self.descriptor(ram, index)?;
            if desc.flags & DescFlags::INDIRECT.bits() != 0 {
                return Err(VirtqueueError::UnsupportedIndirect);
            }
            // The buffer itself must sit inside guest memory.
            if ram.host_ptr(desc.addr, desc.len as usize).is_none() {
                return Err(VirtqueueError::BadAddress);
            }
            let has_next = desc.flags & DescFlags::NEXT.bits() != 0;
            let next = desc.next;
            descs.push(desc);
            if !has_next {
                break;
            }
            index = next;
        }
        Ok(DescChain { head, descs })
    }
}

/// Event-index suppression rule of the split-ring protocol.
fn need_event(event: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_event_boundary() {
        // Interrupt wanted exactly when the event index falls inside the
        // window of newly pushed entries.
        assert!(need_event(2, 3, 2));
        assert!(!need_event(2, 2, 1));
        assert!(need_event(0, 1, 0));
        // Wrapping window
        assert!(need_event(u16::MAX, 0, u16::MAX));
    }
}
