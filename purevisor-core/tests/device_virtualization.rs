//! Virtqueue and virtio device-model tests: ring protocol, the legacy
//! register surface, the block and network back-ends.

extern crate std;

mod common;

use std::boxed::Box;
use std::vec::Vec;

use purevisor_core::storage::RamDisk;
use purevisor_core::virtio::blk::{VirtioBlk, BLK_S_OK, BLK_T_IN, BLK_T_OUT};
use purevisor_core::virtio::net::VirtioNet;
use purevisor_core::virtio::{LegacyIoBus, VirtioDevice, STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK};
use purevisor_core::virtqueue::{DescFlags, VirtqDesc, Virtqueue};
use purevisor_core::vm::GuestRam;

// Guest-side ring helpers ------------------------------------------------

fn write_desc(ram: &GuestRam, desc_base: u64, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
    ram.write_obj(desc_base + 16 * index as u64, VirtqDesc { addr, len, flags, next })
        .unwrap();
}

fn publish_avail(ram: &GuestRam, avail_base: u64, slot: u16, head: u16, new_idx: u16, size: u16) {
    ram.write_obj::<u16>(avail_base + 4 + 2 * (slot % size) as u64, head).unwrap();
    ram.write_obj::<u16>(avail_base + 2, new_idx).unwrap();
}

fn used_idx(ram: &GuestRam, used_base: u64) -> u16 {
    ram.read_obj::<u16>(used_base + 2).unwrap()
}

fn used_elem(ram: &GuestRam, used_base: u64, slot: u16, size: u16) -> (u32, u32) {
    let gpa = used_base + 4 + 8 * (slot % size) as u64;
    (ram.read_obj::<u32>(gpa).unwrap(), ram.read_obj::<u32>(gpa + 4).unwrap())
}

#[test]
fn virtqueue_push_pop_round_trip() {
    // 16-entry queue: descriptor table at 0x1000, available ring at
    // 0x1100, used ring at 0x2000. The guest posts a two-descriptor
    // chain: a read-only header and a write-only 512-byte buffer.
    let ram = GuestRam::new(1 << 20).unwrap();
    let mut q = Virtqueue::disabled();
    q.configure(16, 0x1000, 0x1100, 0x2000);

    write_desc(&ram, 0x1000, 0, 0x3000, 16, DescFlags::NEXT.bits(), 1);
    write_desc(&ram, 0x1000, 1, 0x3100, 512, DescFlags::WRITE.bits(), 0);
    publish_avail(&ram, 0x1100, 0, 0, 1, 16);

    let chain = q.pop(&ram).unwrap().expect("chain available");
    assert_eq!(chain.head, 0);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.write_capacity(), 512);

    // Host fills 200 bytes and completes the chain.
    let payload: Vec<u8> = (0..200u32).map(|i| i as u8 ^ 0x5A).collect();
    ram.write(0x3100, &payload).unwrap();
    q.push(&ram, chain.head, 200).unwrap();

    assert_eq!(used_idx(&ram, 0x2000), 1);
    assert_eq!(used_elem(&ram, 0x2000, 0, 16), (0, 200));
    // Nothing beyond the 200 filled bytes was touched.
    let mut tail = [0u8; 312];
    ram.read(0x3100 + 200, &mut tail).unwrap();
    assert!(tail.iter().all(|&b| b == 0));
    // The ring is drained.
    assert!(q.pop(&ram).unwrap().is_none());
}

#[test]
fn event_idx_suppresses_repeat_notifications() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let mut q = Virtqueue::disabled();
    q.configure(16, 0x1000, 0x1100, 0x2000);
    q.set_event_idx(true);

    // The guest asks to be told once the first element lands
    // (used_event = 0), then nothing further.
    let used_event_gpa = 0x1100 + 4 + 2 * 16;
    ram.write_obj::<u16>(used_event_gpa, 0).unwrap();

    for head in 0u16..3 {
        write_desc(&ram, 0x1000, head, 0x3000 + head as u64 * 0x100, 64, DescFlags::WRITE.bits(), 0);
        publish_avail(&ram, 0x1100, head, head, head + 1, 16);
        let chain = q.pop(&ram).unwrap().expect("chain");
        q.push(&ram, chain.head, 64).unwrap();
    }
    // First push crossed the event index; the rest are suppressed until
    // the guest re-arms and new work lands.
    assert!(q.should_notify(&ram));
    assert!(!q.should_notify(&ram));
    ram.write_obj::<u16>(used_event_gpa, 3).unwrap();
    write_desc(&ram, 0x1000, 3, 0x3300, 64, DescFlags::WRITE.bits(), 0);
    publish_avail(&ram, 0x1100, 3, 3, 4, 16);
    let chain = q.pop(&ram).unwrap().expect("chain");
    q.push(&ram, chain.head, 64).unwrap();
    assert!(q.should_notify(&ram));
}

#[test]
fn cyclic_chains_are_rejected() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let mut q = Virtqueue::disabled();
    q.configure(8, 0x1000, 0x1100, 0x2000);
    // 0 -> 1 -> 0 -> ...
    write_desc(&ram, 0x1000, 0, 0x3000, 16, DescFlags::NEXT.bits(), 1);
    write_desc(&ram, 0x1000, 1, 0x3100, 16, DescFlags::NEXT.bits(), 0);
    publish_avail(&ram, 0x1100, 0, 0, 1, 8);
    assert!(q.pop(&ram).is_err());
}

#[test]
fn descriptor_out_of_range_is_rejected() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let mut q = Virtqueue::disabled();
    q.configure(8, 0x1000, 0x1100, 0x2000);
    assert!(q.descriptor(&ram, 8).is_err());
    write_desc(&ram, 0x1000, 0, 0x3000, 16, 0, 0);
    assert_eq!(q.descriptor(&ram, 0).unwrap().addr, 0x3000);
}

// Device-model helpers ---------------------------------------------------

const BLK_BASE: u16 = 0xC000;
const REG_HOST_FEATURES: u16 = 0x00;
const REG_GUEST_FEATURES: u16 = 0x04;
const REG_QUEUE_PFN: u16 = 0x08;
const REG_QUEUE_NUM: u16 = 0x0C;
const REG_QUEUE_SEL: u16 = 0x0E;
const REG_QUEUE_NOTIFY: u16 = 0x10;
const REG_STATUS: u16 = 0x12;
const REG_ISR: u16 = 0x13;
const REG_CONFIG: u16 = 0x14;

fn handshake(bus: &mut LegacyIoBus, ram: &GuestRam, base: u16) {
    let features = bus.read(base + REG_HOST_FEATURES, 4).unwrap();
    bus.write(base + REG_STATUS, STATUS_ACKNOWLEDGE as u32, 1, ram).unwrap();
    bus.write(base + REG_STATUS, (STATUS_ACKNOWLEDGE | STATUS_DRIVER) as u32, 1, ram).unwrap();
    bus.write(base + REG_GUEST_FEATURES, features, 4, ram).unwrap();
    bus.write(
        base + REG_STATUS,
        (STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK) as u32,
        1,
        ram,
    )
    .unwrap();
    bus.write(
        base + REG_STATUS,
        (STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK) as u32,
        1,
        ram,
    )
    .unwrap();
}

/// Program queue `sel` with its ring pages starting at `base_gpa`.
/// Returns (desc, avail, used) guest addresses for a 256-entry queue.
fn setup_queue(bus: &mut LegacyIoBus, ram: &GuestRam, base: u16, sel: u16, base_gpa: u64) -> (u64, u64, u64) {
    bus.write(base + REG_QUEUE_SEL, sel as u32, 2, ram).unwrap();
    assert_eq!(bus.read(base + REG_QUEUE_NUM, 2), Some(256));
    bus.write(base + REG_QUEUE_PFN, (base_gpa >> 12) as u32, 4, ram).unwrap();
    (base_gpa, base_gpa + 16 * 256, base_gpa + 8192)
}

fn blk_request(
    ram: &GuestRam,
    desc_base: u64,
    avail_base: u64,
    avail_slot: u16,
    req_type: u32,
    sector: u64,
    data_gpa: u64,
    data_len: u32,
    data_writable: bool,
    scratch: u64,
) {
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&req_type.to_le_bytes());
    header[8..].copy_from_slice(&sector.to_le_bytes());
    ram.write(scratch, &header).unwrap();
    // Poison the status byte so OK is distinguishable from "never written".
    ram.write(scratch + 0x80, &[0xFF]).unwrap();

    let first = avail_slot * 3;
    let data_flags = DescFlags::NEXT.bits() | if data_writable { DescFlags::WRITE.bits() } else { 0 };
    write_desc(ram, desc_base, first, scratch, 16, DescFlags::NEXT.bits(), first + 1);
    write_desc(ram, desc_base, first + 1, data_gpa, data_len, data_flags, first + 2);
    write_desc(ram, desc_base, first + 2, scratch + 0x80, 1, DescFlags::WRITE.bits(), 0);
    publish_avail(ram, avail_base, avail_slot, first, avail_slot + 1, 256);
}

#[test]
fn block_device_write_then_read_back() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let disk = RamDisk::new(1 << 20);
    let device = VirtioDevice::new(Box::new(VirtioBlk::new(Box::new(disk), "pv-blk-0")), 0x24);
    let mut bus = LegacyIoBus::new();
    bus.attach(BLK_BASE, device).unwrap();

    // Capacity is advertised in 512-byte sectors.
    let cap_lo = bus.read(BLK_BASE + REG_CONFIG, 4).unwrap() as u64;
    let cap_hi = bus.read(BLK_BASE + REG_CONFIG + 4, 4).unwrap() as u64;
    assert_eq!((cap_hi << 32) | cap_lo, (1 << 20) / 512);

    handshake(&mut bus, &ram, BLK_BASE);
    let (desc, avail, used) = setup_queue(&mut bus, &ram, BLK_BASE, 0, 0x4000);

    // OUT: one 512-byte sector of patterned payload at sector 3.
    let payload: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    ram.write(0x10000, &payload).unwrap();
    blk_request(&ram, desc, avail, 0, BLK_T_OUT, 3, 0x10000, 512, false, 0x20000);
    let irq = bus.write(BLK_BASE + REG_QUEUE_NOTIFY, 0, 2, &ram).unwrap();
    assert_eq!(irq, Some(0x24));
    assert_eq!(used_idx(&ram, used), 1);
    let (id, len) = used_elem(&ram, used, 0, 256);
    assert_eq!(id, 0);
    assert_eq!(len, 1); // status byte only
    let mut status = [0xFFu8];
    ram.read(0x20000 + 0x80, &mut status).unwrap();
    assert_eq!(status[0], BLK_S_OK);

    // The interrupt-status byte reads set, then clears.
    assert_eq!(bus.read(BLK_BASE + REG_ISR, 1), Some(1));
    assert_eq!(bus.read(BLK_BASE + REG_ISR, 1), Some(0));

    // IN: read the sector back into a fresh guest buffer.
    blk_request(&ram, desc, avail, 1, BLK_T_IN, 3, 0x11000, 512, true, 0x21000);
    bus.write(BLK_BASE + REG_QUEUE_NOTIFY, 0, 2, &ram).unwrap();
    assert_eq!(used_idx(&ram, used), 2);
    let (_, len) = used_elem(&ram, used, 1, 256);
    assert_eq!(len, 513); // data + status byte
    let mut back = vec![0u8; 512];
    ram.read(0x11000, &mut back).unwrap();
    assert_eq!(back, payload);
}

#[test]
fn out_of_order_status_writes_are_ignored() {
    let ram = GuestRam::new(1 << 16).unwrap();
    let disk = RamDisk::new(1 << 20);
    let device = VirtioDevice::new(Box::new(VirtioBlk::new(Box::new(disk), "pv-blk-1")), 0x24);
    let mut bus = LegacyIoBus::new();
    bus.attach(BLK_BASE, device).unwrap();

    // Jumping straight to DRIVER_OK skips three handshake steps.
    bus.write(BLK_BASE + REG_STATUS, STATUS_DRIVER_OK as u32, 1, &ram).unwrap();
    assert_eq!(bus.read(BLK_BASE + REG_STATUS, 1), Some(0));
    // Each step in order is accepted.
    bus.write(BLK_BASE + REG_STATUS, STATUS_ACKNOWLEDGE as u32, 1, &ram).unwrap();
    assert_eq!(bus.read(BLK_BASE + REG_STATUS, 1), Some(STATUS_ACKNOWLEDGE as u32));
    // Skipping DRIVER is still refused.
    bus.write(
        BLK_BASE + REG_STATUS,
        (STATUS_ACKNOWLEDGE | STATUS_FEATURES_OK) as u32,
        1,
        &ram,
    )
    .unwrap();
    assert_eq!(bus.read(BLK_BASE + REG_STATUS, 1), Some(STATUS_ACKNOWLEDGE as u32));
    // Zero resets everything.
    bus.write(BLK_BASE + REG_STATUS, 0, 1, &ram).unwrap();
    assert_eq!(bus.read(BLK_BASE + REG_STATUS, 1), Some(0));
}

#[test]
fn net_loopback_reflects_tx_to_rx() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let device = VirtioDevice::new(
        Box::new(VirtioNet::new_loopback([0x52, 0x54, 0x00, 0xAA, 0xBB, 0xCC])),
        0x25,
    );
    let mut bus = LegacyIoBus::new();
    bus.attach(BLK_BASE, device).unwrap();

    // MAC is visible in device configuration space.
    let mac_lo = bus.read(BLK_BASE + REG_CONFIG, 4).unwrap();
    assert_eq!(mac_lo.to_le_bytes(), [0x52, 0x54, 0x00, 0xAA]);

    handshake(&mut bus, &ram, BLK_BASE);
    let (rx_desc, rx_avail, rx_used) = setup_queue(&mut bus, &ram, BLK_BASE, 0, 0x10000);
    let (tx_desc, tx_avail, tx_used) = setup_queue(&mut bus, &ram, BLK_BASE, 1, 0x20000);

    // Guest posts one 2 KiB RX buffer.
    write_desc(&ram, rx_desc, 0, 0x40000, 2048, DescFlags::WRITE.bits(), 0);
    publish_avail(&ram, rx_avail, 0, 0, 1, 256);

    // Guest transmits a 60-byte frame behind the 10-byte header.
    let frame: Vec<u8> = (0..60u32).map(|i| i as u8).collect();
    ram.write(0x50000, &[0u8; 10]).unwrap(); // header
    ram.write(0x50010, &frame).unwrap();
    write_desc(&ram, tx_desc, 0, 0x50000, 10, DescFlags::NEXT.bits(), 1);
    write_desc(&ram, tx_desc, 1, 0x50010, 60, 0, 0);
    publish_avail(&ram, tx_avail, 0, 0, 1, 256);

    let irq = bus.write(BLK_BASE + REG_QUEUE_NOTIFY, 1, 2, &ram).unwrap();
    assert_eq!(irq, Some(0x25));

    // TX consumed, and the frame came back on RX with a fresh header.
    assert_eq!(used_idx(&ram, tx_used), 1);
    assert_eq!(used_idx(&ram, rx_used), 1);
    let (id, len) = used_elem(&ram, rx_used, 0, 256);
    assert_eq!(id, 0);
    assert_eq!(len, 10 + 60);
    let mut got = vec![0u8; 60];
    ram.read(0x40000 + 10, &mut got).unwrap();
    assert_eq!(got, frame);
}

#[test]
fn external_rx_reaches_guest_through_injector() {
    use std::cell::RefCell;
    use std::vec::Vec as StdVec;

    use purevisor_core::vm_manager::VmManager;
    use purevisor_hal::interrupts::InterruptInjector;
    use purevisor_hal::memory::HeapFrameAllocator;
    use purevisor_hal::net::RxSink;
    use purevisor_hal::time::ManualClock;
    use purevisor_hal::HostMap;

    struct Recorder(RefCell<StdVec<(u32, u8)>>);
    impl InterruptInjector for Recorder {
        fn inject(&self, vcpu: u32, vector: u8) {
            self.0.borrow_mut().push((vcpu, vector));
        }
    }

    let mut mgr = VmManager::new(
        common::ScriptedRunner::new(std::iter::empty()),
        Box::new(HeapFrameAllocator::new()),
        HostMap::identity(),
        Box::new(ManualClock::new()),
        7,
    );
    let vm_id = mgr.create("netvm", 1 << 20, 1).unwrap();
    mgr.start(vm_id).unwrap();

    let net = VirtioNet::new_loopback([2, 0, 0, 0, 0, 1]);
    let mut sink = net.rx_sink();
    {
        let vm = mgr.vm_mut(vm_id).unwrap();
        vm.bus.attach(BLK_BASE, VirtioDevice::new(Box::new(net), 0x26)).unwrap();
        handshake(&mut vm.bus, &vm.ram, BLK_BASE);
        let (rx_desc, rx_avail, _) = setup_queue(&mut vm.bus, &vm.ram, BLK_BASE, 0, 0x10000);
        write_desc(&vm.ram, rx_desc, 0, 0x40000, 2048, DescFlags::WRITE.bits(), 0);
        publish_avail(&vm.ram, rx_avail, 0, 0, 1, 256);
    }

    // A frame arrives from the fabric while the guest is idle.
    sink.receive(&[0xEE; 42]);
    let injector = Recorder(RefCell::new(StdVec::new()));
    mgr.flush_device_work(vm_id, &injector).unwrap();

    assert_eq!(injector.0.borrow().as_slice(), &[(0, 0x26)]);
    let vm = mgr.vm(vm_id).unwrap();
    let mut got = [0u8; 42];
    vm.ram.read(0x40000 + 10, &mut got).unwrap();
    assert_eq!(got, [0xEE; 42]);
}

#[test]
fn queue_introspection_reports_depth_and_used() {
    let ram = GuestRam::new(1 << 20).unwrap();
    let disk = RamDisk::new(1 << 20);
    let device = VirtioDevice::new(Box::new(VirtioBlk::new(Box::new(disk), "pv-blk-2")), 0x24);
    let mut bus = LegacyIoBus::new();
    bus.attach(BLK_BASE, device).unwrap();
    handshake(&mut bus, &ram, BLK_BASE);
    let (desc, avail, _) = setup_queue(&mut bus, &ram, BLK_BASE, 0, 0x4000);

    // One posted but unserviced request shows as depth 1.
    write_desc(&ram, desc, 0, 0x30000, 16, 0, 0);
    publish_avail(&ram, avail, 0, 0, 1, 256);
    let dev = bus.device_mut(0).unwrap();
    let (depth, last_used, _pending) = dev.queue_state(0, &ram).unwrap();
    assert_eq!(depth, 1);
    assert_eq!(last_used, 0);
}
