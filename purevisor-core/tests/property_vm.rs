//! Property tests for the core invariants: translation uniqueness, ring
//! write bounds, pool extent accounting, the device status sequence, and
//! control-block population.

extern crate std;

use std::boxed::Box;
use std::collections::BTreeSet;
use std::vec::Vec;

use proptest::prelude::*;

use purevisor_core::gpt::{CacheType, Gpt, LEAF_4K};
use purevisor_core::storage::{ExtentPool, ExtentState, RamDisk, ReplicationMode};
use purevisor_core::vcb;
use purevisor_core::vcpu::Vcpu;
use purevisor_core::virtio::blk::{VirtioBlk, BLK_T_FLUSH, BLK_T_GET_ID, BLK_T_IN, BLK_T_OUT};
use purevisor_core::virtio::{VirtioBackend, VirtioDevice, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK};
use purevisor_core::virtqueue::{DescFlags, VirtqDesc, Virtqueue};
use purevisor_core::vm::GuestRam;
use purevisor_hal::arch::x86_64::vmx::{VmxCapabilities, CPU2_ENABLE_EPT};
use purevisor_hal::arch::x86_64::HostState;
use purevisor_hal::memory::{HeapFrameAllocator, HostMap, MemoryFlags, PAGE_SIZE};

proptest! {
    /// Every installed mapping translates to its host address and nothing
    /// else resolves.
    #[test]
    fn gpt_translate_matches_mappings(pages in proptest::collection::btree_set(0u64..512, 1..40)) {
        let mut alloc = HeapFrameAllocator::new();
        let mut gpt = Gpt::new(&mut alloc, HostMap::identity()).unwrap();
        for &page in &pages {
            let guest = page * LEAF_4K;
            let host = 0x4000_0000 + page * LEAF_4K;
            gpt.map_range(&mut alloc, guest, host, LEAF_4K, MemoryFlags::RWX, CacheType::WriteBack)
                .unwrap();
        }
        for page in 0u64..512 {
            let guest = page * LEAF_4K + 0x123;
            let hit = gpt.translate(guest);
            if pages.contains(&page) {
                prop_assert_eq!(hit, Some((0x4000_0000 + page * LEAF_4K + 0x123, LEAF_4K)));
            } else {
                prop_assert_eq!(hit, None);
            }
        }
        gpt.destroy(&mut alloc);
    }

    /// The host never writes more bytes into a chain than its
    /// device-writable descriptors can hold, and never touches
    /// device-readable buffers.
    #[test]
    fn blk_writes_bounded_by_writable_capacity(
        req_type in prop_oneof![Just(BLK_T_IN), Just(BLK_T_OUT), Just(BLK_T_FLUSH), Just(BLK_T_GET_ID), Just(99u32)],
        lens in proptest::collection::vec(1u32..256, 0..6),
        sector in 0u64..64,
    ) {
        let ram = GuestRam::new(1 << 20).unwrap();
        let mut queues = [Virtqueue::disabled()];
        queues[0].configure(64, 0x1000, 0x1500, 0x2000);

        let data_writable = req_type != BLK_T_OUT;
        // Header at 0x8000, data buffers spaced behind it, status last.
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&req_type.to_le_bytes());
        header[8..].copy_from_slice(&sector.to_le_bytes());
        ram.write(0x8000, &header).unwrap();

        let count = lens.len() as u16;
        ram.write_obj(0x1000u64, VirtqDesc { addr: 0x8000, len: 16, flags: DescFlags::NEXT.bits(), next: 1 }).unwrap();
        let mut readable_payloads = Vec::new();
        for (i, &len) in lens.iter().enumerate() {
            let addr = 0x10000 + i as u64 * 0x400;
            let flags = DescFlags::NEXT.bits() | if data_writable { DescFlags::WRITE.bits() } else { 0 };
            if !data_writable {
                let payload: Vec<u8> = (0..len).map(|b| (b % 199) as u8).collect();
                ram.write(addr, &payload).unwrap();
                readable_payloads.push((addr, payload));
            }
            ram.write_obj(0x1000u64 + 16 * (1 + i as u64), VirtqDesc { addr, len, flags, next: 2 + i as u16 }).unwrap();
        }
        ram.write_obj(0x1000u64 + 16 * (1 + count as u64), VirtqDesc { addr: 0x9000, len: 1, flags: DescFlags::WRITE.bits(), next: 0 }).unwrap();
        ram.write_obj::<u16>(0x1504, 0).unwrap(); // avail.ring[0] = head 0
        ram.write_obj::<u16>(0x1502, 1).unwrap(); // avail.idx = 1

        let writable_capacity: u64 = if data_writable { lens.iter().map(|&l| l as u64).sum::<u64>() } else { 0 } + 1;

        let mut backend = VirtioBlk::new(Box::new(RamDisk::new(1 << 20)), "prop-blk");
        backend.queue_notify(0, &mut queues, &ram).unwrap();

        let used_len = ram.read_obj::<u32>(0x2004 + 4).unwrap();
        prop_assert!(used_len as u64 <= writable_capacity);
        // Device-readable buffers are untouched.
        for (addr, payload) in readable_payloads {
            let mut now = vec![0u8; payload.len()];
            ram.read(addr, &mut now).unwrap();
            prop_assert_eq!(now, payload);
        }
    }

    /// Free + Allocated + Reserved always equals the extent population,
    /// and no Allocated extent is mapped by two volumes.
    #[test]
    fn pool_accounting_invariants(ops in proptest::collection::vec(0u8..6, 1..40)) {
        let mut pool = ExtentPool::new("prop", 4 << 20, 99);
        pool.add_device(Box::new(RamDisk::new(64 << 20))).unwrap();
        pool.add_device(Box::new(RamDisk::new(64 << 20))).unwrap();
        let mut created: Vec<u32> = Vec::new();
        let mut counter = 0u32;

        for op in ops {
            counter += 1;
            match op {
                0 => {
                    let name = std::format!("v{}", counter);
                    if let Ok(id) = pool.create_volume(&name, 8 << 20, ReplicationMode::None, true) {
                        created.push(id);
                    }
                }
                1 => {
                    let name = std::format!("t{}", counter);
                    if let Ok(id) = pool.create_volume(&name, 8 << 20, ReplicationMode::Mirror, false) {
                        created.push(id);
                    }
                }
                2 => {
                    if let Some(&id) = created.first() {
                        let _ = pool.volume_write(id, 0, &[counter as u8; 4096]);
                    }
                }
                3 => {
                    if let Some(&id) = created.first() {
                        let name = std::format!("s{}", counter);
                        if let Ok(id) = pool.snapshot_volume(id, &name) {
                            created.push(id);
                        }
                    }
                }
                4 => {
                    if created.len() > 1 {
                        let id = created.swap_remove(1);
                        let _ = pool.delete_volume(id);
                    }
                }
                _ => {
                    if let Some(&id) = created.last() {
                        let _ = pool.volume_zero(id, 0, 8192);
                    }
                }
            }

            let total = pool.total_extents();
            let sum = pool.extents_in_state(ExtentState::Free)
                + pool.extents_in_state(ExtentState::Allocated)
                + pool.extents_in_state(ExtentState::Reserved);
            prop_assert_eq!(sum, total);
            prop_assert_eq!(pool.extents_in_state(ExtentState::Free), pool.free_extents());

            // Allocated extents belong to exactly one volume map.
            let ids: Vec<u32> = pool.volume_ids().collect();
            let mut seen_allocated = BTreeSet::new();
            for &vid in &ids {
                for &extent in pool.volume(vid).unwrap().extent_map.iter().filter(|&&e| e != 0) {
                    if pool.extent_state(extent) == Some(ExtentState::Allocated) {
                        prop_assert!(seen_allocated.insert(extent), "extent {} mapped twice", extent);
                    }
                }
            }
        }
    }

    /// Reads of the status byte only ever reveal prefixes of the
    /// handshake sequence, whatever the driver writes.
    #[test]
    fn status_transitions_are_prefix_closed(writes in proptest::collection::vec(0u8..=255, 0..24)) {
        let ram = GuestRam::new(1 << 16).unwrap();
        let mut device = VirtioDevice::new(
            Box::new(VirtioBlk::new(Box::new(RamDisk::new(1 << 20)), "prop")),
            0x24,
        );
        let prefixes = [
            0u8,
            STATUS_ACKNOWLEDGE,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK,
        ];
        for value in writes {
            let _ = device.io_write(0x12, value as u32, 1, &ram);
            let status = device.status() & 0x0F;
            prop_assert!(prefixes.contains(&status), "status {:#x} escaped the sequence", status);
        }
    }

    /// Populated control blocks stay inside the hardware-allowed control
    /// ranges and own page-aligned bitmap pages.
    #[test]
    fn vcb_controls_within_allowed_ranges(extra in 0u32..0xFFFF, fixed in 0u32..0xFF) {
        let mut caps = VmxCapabilities::synthetic();
        // Narrow the permitted sets while keeping every required bit.
        caps.cpu_based.permitted = !0 ^ (extra & 0x00F0);
        caps.pin_based.fixed1 = fixed & 0x55;
        let mut alloc = HeapFrameAllocator::new();
        let mut vcpu = Vcpu::new(0, &mut alloc, HostMap::identity()).unwrap();
        let populated = vcb::populate(&mut vcpu, &caps, &HostState::default(), 0x1000 | 6 | (3 << 3));
        if let Ok(()) = populated {
            let c = &vcpu.image.controls;
            prop_assert_eq!(c.pin_based & !caps.pin_based.permitted, 0);
            prop_assert_eq!(c.pin_based & caps.pin_based.fixed1, caps.pin_based.fixed1);
            prop_assert_eq!(c.cpu_based & !caps.cpu_based.permitted, 0);
            prop_assert_eq!(c.secondary & CPU2_ENABLE_EPT, CPU2_ENABLE_EPT);
            for bitmap in [c.io_bitmap_a, c.io_bitmap_b, c.msr_bitmap] {
                prop_assert_eq!(bitmap % PAGE_SIZE as u64, 0);
            }
            prop_assert!(c.io_bitmap_a != c.io_bitmap_b);
        }
        vcpu.destroy(&mut alloc);
    }
}

#[test]
fn populate_rejects_missing_required_control() {
    let mut caps = VmxCapabilities::synthetic();
    caps.secondary.permitted &= !CPU2_ENABLE_EPT;
    let mut alloc = HeapFrameAllocator::new();
    let mut vcpu = Vcpu::new(0, &mut alloc, HostMap::identity()).unwrap();
    assert!(vcb::populate(&mut vcpu, &caps, &HostState::default(), 0).is_err());
    vcpu.destroy(&mut alloc);
}
