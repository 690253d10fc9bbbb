//! End-to-end flow across subsystems: a guest block write delegated by
//! the exit dispatcher lands in a pooled, replicated volume, and the
//! completion interrupt reaches the VCPU.

extern crate std;

mod common;

use std::boxed::Box;
use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;

use common::{exit_hlt, exit_io_out16, ScriptedRunner};
use purevisor_core::storage::{ExtentPool, PoolVolumeDevice, RamDisk, ReplicationMode};
use purevisor_core::virtio::blk::{VirtioBlk, BLK_T_IN, BLK_T_OUT};
use purevisor_core::virtio::{
    VirtioDevice, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK,
};
use purevisor_core::virtqueue::{DescFlags, VirtqDesc};
use purevisor_core::vm::GuestRam;
use purevisor_core::vm_manager::VmManager;
use purevisor_hal::memory::{HeapFrameAllocator, HostMap};
use purevisor_hal::time::ManualClock;

const BASE: u16 = 0xC000;
const MARKER: &[u8; 24] = b"PureVisor Storage Test!\0";

fn write_desc(ram: &GuestRam, desc_base: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    ram.write_obj(desc_base + 16 * index as u64, VirtqDesc { addr, len, flags, next })
        .unwrap();
}

fn post_request(ram: &GuestRam, req_type: u32, sector: u64, data_gpa: u64, writable: bool, slot: u16) {
    let desc = 0x4000u64;
    let avail = desc + 16 * 256;
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&req_type.to_le_bytes());
    header[8..].copy_from_slice(&sector.to_le_bytes());
    let scratch = 0x20000 + slot as u64 * 0x1000;
    ram.write(scratch, &header).unwrap();
    ram.write(scratch + 0x80, &[0xFF]).unwrap();

    let first = slot * 3;
    let data_flags = DescFlags::NEXT.bits() | if writable { DescFlags::WRITE.bits() } else { 0 };
    write_desc(ram, desc, first, scratch, 16, DescFlags::NEXT.bits(), first + 1);
    write_desc(ram, desc, first + 1, data_gpa, 512, data_flags, first + 2);
    write_desc(ram, desc, first + 2, scratch + 0x80, 1, DescFlags::WRITE.bits(), 0);
    ram.write_obj::<u16>(avail + 4 + 2 * slot as u64, first).unwrap();
    ram.write_obj::<u16>(avail + 2, slot + 1).unwrap();
}

#[test]
fn guest_block_write_reaches_the_replicated_pool() {
    // Hyperconverged stack: two RAM-backed pool devices, a mirrored
    // volume, a virtio-blk function exposing that volume to the guest.
    let mut pool = ExtentPool::new("hci", 4 << 20, 11);
    pool.add_device(Box::new(RamDisk::new(32 << 20))).unwrap();
    pool.add_device(Box::new(RamDisk::new(32 << 20))).unwrap();
    let volume = pool.create_volume("guest-disk", 8 << 20, ReplicationMode::Mirror, true).unwrap();
    let pool = Arc::new(Mutex::new(pool));

    // The guest OUTs to the notify register twice (write, then read
    // back), and halts.
    let script = std::vec![
        exit_io_out16(BASE + 0x10),
        exit_io_out16(BASE + 0x10),
        exit_hlt(),
    ];
    let runner = ScriptedRunner::new(script);
    let injections = runner.injections();
    let mut mgr = VmManager::new(
        runner,
        Box::new(HeapFrameAllocator::new()),
        HostMap::identity(),
        Box::new(ManualClock::new()),
        3,
    );
    let vm_id = mgr.create("hci-guest", 1 << 20, 1).unwrap();
    {
        let vm = mgr.vm_mut(vm_id).unwrap();
        let disk = PoolVolumeDevice::new(pool.clone(), volume);
        vm.bus
            .attach(BASE, VirtioDevice::new(Box::new(VirtioBlk::new(Box::new(disk), "hci-vol-0")), 0x24))
            .unwrap();
        // Driver handshake and queue programming.
        for status in [
            STATUS_ACKNOWLEDGE,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK,
        ] {
            vm.bus.write(BASE + 0x12, status as u32, 1, &vm.ram).unwrap();
        }
        vm.bus.write(BASE + 0x0E, 0, 2, &vm.ram).unwrap();
        vm.bus.write(BASE + 0x08, 0x4, 4, &vm.ram).unwrap(); // rings at 0x4000

        let mut sector = [0u8; 512];
        sector[..MARKER.len()].copy_from_slice(MARKER);
        vm.ram.write(0x10000, &sector).unwrap();
        post_request(&vm.ram, BLK_T_OUT, 0, 0x10000, false, 0);
        post_request(&vm.ram, BLK_T_IN, 0, 0x11000, true, 1);
    }

    mgr.start(vm_id).unwrap();
    // The notify value rides in the guest's A register.
    mgr.vm_mut(vm_id).unwrap().vcpus[0].gprs.rax = 0;
    mgr.run_vcpu(vm_id, 0).unwrap();

    let vm = mgr.vm(vm_id).unwrap();
    // The completion interrupt reached the VCPU at a subsequent entry.
    assert_eq!(injections.borrow().as_slice(), &[0x24]);

    // The read-back path observed the marker through the pool.
    let mut got = [0u8; 24];
    vm.ram.read(0x11000, &mut got).unwrap();
    assert_eq!(&got, MARKER);

    // And the pool volume itself carries it, on one allocated extent.
    let mut from_pool = Vec::from([0u8; 24]);
    pool.lock().volume_read(volume, 0, &mut from_pool).unwrap();
    assert_eq!(from_pool.as_slice(), MARKER);
    assert_eq!(pool.lock().volume(volume).unwrap().allocated_extents(), 1);
}
