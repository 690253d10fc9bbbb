//! Virtio device model
//!
//! A PCI-like function surfaced to the guest over the legacy I/O register
//! layout: feature words, queue select/PFN/notify, the status byte with
//! its strictly monotonic handshake, the read-and-clear interrupt-status
//! byte, and a device-specific configuration window behind them. The
//! device-specific behaviour plugs in through [`VirtioBackend`].

pub mod blk;
pub mod net;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::virtqueue::{Virtqueue, VirtqueueError};
use crate::vm::GuestRam;

/// PCI vendor id of every virtio function.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Virtqueues one device may expose.
pub const MAX_VIRTQUEUES: usize = 8;

/// Transitional PCI device id base (device id = base + virtio type - 1).
const PCI_DEVICE_ID_BASE: u16 = 0x1000;

/// Feature bit: the driver uses the used-event/avail-event suppression.
pub const F_EVENT_IDX: u64 = 1 << 29;

// Status byte bits, in handshake order.
pub const STATUS_ACKNOWLEDGE: u8 = 1;
pub const STATUS_DRIVER: u8 = 2;
pub const STATUS_DRIVER_OK: u8 = 4;
pub const STATUS_FEATURES_OK: u8 = 8;
pub const STATUS_NEEDS_RESET: u8 = 0x40;
pub const STATUS_FAILED: u8 = 0x80;

// Legacy register layout
const REG_HOST_FEATURES: u16 = 0x00;
const REG_GUEST_FEATURES: u16 = 0x04;
const REG_QUEUE_PFN: u16 = 0x08;
const REG_QUEUE_NUM: u16 = 0x0C;
const REG_QUEUE_SEL: u16 = 0x0E;
const REG_QUEUE_NOTIFY: u16 = 0x10;
const REG_STATUS: u16 = 0x12;
const REG_ISR: u16 = 0x13;
const REG_CONFIG: u16 = 0x14;

/// Virtio device model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    BadQueue,
    /// Guest violated the ring protocol; the device is isolated until the
    /// guest drives it through Reset.
    Protocol(VirtqueueError),
    /// Back-end failure (I/O error and the like).
    Backend,
}

impl From<VirtqueueError> for VirtioError {
    fn from(err: VirtqueueError) -> Self {
        VirtioError::Protocol(err)
    }
}

/// Device-specific half of a virtio function.
pub trait VirtioBackend: Send {
    /// Virtio device type (1 = network, 2 = block).
    fn device_type(&self) -> u16;

    /// Virtqueues this device exposes.
    fn num_queues(&self) -> u16;

    /// Feature word the device offers.
    fn host_features(&self) -> u64;

    /// Device-specific configuration read, one byte at a time.
    fn config_read(&self, offset: u64) -> u8;

    /// Device-specific configuration write.
    fn config_write(&mut self, offset: u64, value: u8) {
        let _ = (offset, value);
    }

    /// Device-specific reset hook.
    fn on_reset(&mut self) {}

    /// Service a queue notification. Returns whether used entries were
    /// pushed that warrant interrupting the guest.
    fn queue_notify(
        &mut self,
        queue: u16,
        queues: &mut [Virtqueue],
        ram: &GuestRam,
    ) -> Result<bool, VirtioError>;

    /// Device-initiated work outside any guest notify (e.g. frames that
    /// arrived from the fabric). Same interrupt contract as queue_notify.
    fn poll(&mut self, queues: &mut [Virtqueue], ram: &GuestRam) -> Result<bool, VirtioError> {
        let _ = (queues, ram);
        Ok(false)
    }
}

/// One virtio function: configuration surface, status machine, queues and
/// the plugged-in back-end.
pub struct VirtioDevice {
    pub vendor_id: u16,
    pub device_id: u16,
    status: u8,
    host_features: u64,
    guest_features: u64,
    queue_sel: u16,
    queues: [Virtqueue; MAX_VIRTQUEUES],
    isr: u8,
    irq_vector: u8,
    backend: Box<dyn VirtioBackend>,
}

impl VirtioDevice {
    pub fn new(backend: Box<dyn VirtioBackend>, irq_vector: u8) -> Self {
        let device_id = PCI_DEVICE_ID_BASE + backend.device_type() - 1;
        let host_features = backend.host_features();
        VirtioDevice {
            vendor_id: VIRTIO_VENDOR_ID,
            device_id,
            status: 0,
            host_features,
            guest_features: 0,
            queue_sel: 0,
            queues: [const { Virtqueue::disabled() }; MAX_VIRTQUEUES],
            isr: 0,
            irq_vector,
            backend,
        }
    }

    pub fn irq_vector(&self) -> u8 {
        self.irq_vector
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn negotiated_features(&self) -> u64 {
        self.guest_features & self.host_features
    }

    /// Whether the driver completed the handshake and the device is live.
    pub fn is_live(&self) -> bool {
        self.status & STATUS_DRIVER_OK != 0 && self.status & STATUS_NEEDS_RESET == 0
    }

    /// Queue introspection: (depth, last used index, pending notify).
    pub fn queue_state(&mut self, queue: u16, ram: &GuestRam) -> Option<(u16, u16, bool)> {
        let q = self.queues.get_mut(queue as usize)?;
        if !q.is_ready() {
            return None;
        }
        let depth = q.queue_depth(ram);
        let last_used = q.last_used_index();
        let pending = q.should_notify(ram);
        Some((depth, last_used, pending))
    }

    /// Register read from the legacy window.
    pub fn io_read(&mut self, offset: u16, size: u8) -> u32 {
        match offset {
            REG_HOST_FEATURES => self.host_features as u32,
            REG_GUEST_FEATURES => self.guest_features as u32,
            REG_QUEUE_PFN => self.selected().map_or(0, Virtqueue::pfn),
            REG_QUEUE_NUM => self.selected_size() as u32,
            REG_QUEUE_SEL => self.queue_sel as u32,
            REG_STATUS => self.status as u32,
            REG_ISR => {
                // Read-and-clear
                let value = self.isr;
                self.isr = 0;
                value as u32
            }
            _ if offset >= REG_CONFIG => {
                let mut value = 0u32;
                for i in 0..size.min(4) {
                    let byte = self.backend.config_read((offset - REG_CONFIG + i as u16) as u64);
                    value |= (byte as u32) << (8 * i);
                }
                value
            }
            _ => !0,
        }
    }

    /// Register write into the legacy window. Returns whether the guest
    /// should be interrupted as a consequence (notify processing).
    pub fn io_write(
        &mut self,
        offset: u16,
        value: u32,
        size: u8,
        ram: &GuestRam,
    ) -> Result<bool, VirtioError> {
        match offset {
            REG_GUEST_FEATURES => {
                self.guest_features = value as u64;
                Ok(false)
            }
            REG_QUEUE_PFN => {
                let num = self.selected_size();
                if num == 0 {
                    // Selector points past the device's queues.
                    return Ok(false);
                }
                let event_idx = self.negotiated_features() & F_EVENT_IDX != 0;
                if let Some(q) = self.selected_mut() {
                    q.configure_legacy(value, num);
                    q.set_event_idx(event_idx);
                }
                Ok(false)
            }
            REG_QUEUE_SEL => {
                self.queue_sel = value as u16;
                Ok(false)
            }
            REG_QUEUE_NOTIFY => self.queue_notify(value as u16, ram),
            REG_STATUS => {
                self.write_status(value as u8);
                Ok(false)
            }
            _ if offset >= REG_CONFIG => {
                for i in 0..size.min(4) {
                    self.backend
                        .config_write((offset - REG_CONFIG + i as u16) as u64, (value >> (8 * i)) as u8);
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Service a guest notification on `queue`.
    ///
    /// Protocol violations isolate the device behind NEEDS_RESET; back-end
    /// processing resumes only after the guest drives a Reset.
    pub fn queue_notify(&mut self, queue: u16, ram: &GuestRam) -> Result<bool, VirtioError> {
        if !self.is_live() {
            return Ok(false);
        }
        if queue as usize >= MAX_VIRTQUEUES || queue >= self.backend.num_queues() {
            return Err(VirtioError::BadQueue);
        }
        let result = self.backend.queue_notify(queue, &mut self.queues, ram);
        self.finish_backend_work(result)
    }

    /// Run device-initiated work (e.g. received frames waiting for guest
    /// RX buffers). Returns whether the guest should be interrupted.
    pub fn poll(&mut self, ram: &GuestRam) -> Result<bool, VirtioError> {
        if !self.is_live() {
            return Ok(false);
        }
        let result = self.backend.poll(&mut self.queues, ram);
        self.finish_backend_work(result)
    }

    fn finish_backend_work(&mut self, result: Result<bool, VirtioError>) -> Result<bool, VirtioError> {
        match result {
            Ok(raise) => {
                if raise {
                    self.isr |= 1;
                }
                Ok(raise)
            }
            Err(VirtioError::Protocol(violation)) => {
                log_warn!(
                    "virtio device {:04x}: ring protocol violation {:?}, needs reset",
                    self.device_id,
                    violation
                );
                self.status |= STATUS_NEEDS_RESET;
                Err(VirtioError::Protocol(violation))
            }
            Err(other) => Err(other),
        }
    }

    fn write_status(&mut self, value: u8) {
        if value == 0 {
            self.reset();
            return;
        }
        let current = self.status & !(STATUS_NEEDS_RESET | STATUS_FAILED);
        if value & current != current {
            // Clearing handshake bits without a full reset is not part of
            // the protocol.
            log_warn!("virtio device {:04x}: ignored status write {:02x}", self.device_id, value);
            return;
        }
        let added = value & !current;
        // The handshake admits exactly one next step from each state.
        let next_allowed = match current {
            0 => STATUS_ACKNOWLEDGE,
            s if s == STATUS_ACKNOWLEDGE => STATUS_DRIVER,
            s if s == STATUS_ACKNOWLEDGE | STATUS_DRIVER => STATUS_FEATURES_OK,
            s if s == STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK => STATUS_DRIVER_OK,
            _ => 0,
        };
        if added & !(next_allowed | STATUS_FAILED) != 0 {
            log_warn!(
                "virtio device {:04x}: out-of-order status write {:02x} over {:02x}",
                self.device_id,
                value,
                current
            );
            return;
        }
        if added & STATUS_FEATURES_OK != 0 {
            // Feature validation gate: the driver must not claim bits the
            // device never offered.
            if self.guest_features & !self.host_features != 0 {
                log_warn!(
                    "virtio device {:04x}: rejected features {:016x}",
                    self.device_id,
                    self.guest_features
                );
                return; // FEATURES_OK stays clear; the driver reads it back
            }
        }
        self.status |= added & (next_allowed | STATUS_FAILED);
        if added & STATUS_DRIVER_OK != 0 {
            let event_idx = self.negotiated_features() & F_EVENT_IDX != 0;
            for q in &mut self.queues {
                q.set_event_idx(event_idx);
            }
        }
    }

    fn reset(&mut self) {
        self.status = 0;
        self.isr = 0;
        self.guest_features = 0;
        self.queue_sel = 0;
        for q in &mut self.queues {
            q.reset();
        }
        self.backend.on_reset();
    }

    fn selected(&self) -> Option<&Virtqueue> {
        self.queues.get(self.queue_sel as usize)
    }

    fn selected_mut(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn selected_size(&self) -> u16 {
        if self.queue_sel < self.backend.num_queues().min(MAX_VIRTQUEUES as u16) {
            crate::virtqueue::MAX_QUEUE_SIZE
        } else {
            0
        }
    }
}

/// Port window reserved per device on the legacy bus.
pub const DEVICE_WINDOW: u16 = 0x100;

/// The legacy programmed-I/O bus carrying a VM's virtio devices.
///
/// The I/O exit handler routes port accesses here; ports outside any
/// window fall back to the dispatcher defaults (all-ones reads, dropped
/// writes).
pub struct LegacyIoBus {
    slots: Vec<(u16, VirtioDevice)>,
}

impl LegacyIoBus {
    pub const fn new() -> Self {
        LegacyIoBus { slots: Vec::new() }
    }

    /// Attach a device at `base`, which must be window-aligned and free.
    pub fn attach(&mut self, base: u16, device: VirtioDevice) -> Result<(), VirtioError> {
        if base % DEVICE_WINDOW != 0 || self.slots.iter().any(|(b, _)| *b == base) {
            return Err(VirtioError::BadQueue);
        }
        self.slots.push((base, device));
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut VirtioDevice> {
        self.slots.get_mut(index).map(|(_, d)| d)
    }

    fn route(&mut self, port: u16) -> Option<(&mut VirtioDevice, u16)> {
        self.slots
            .iter_mut()
            .find(|(base, _)| port >= *base && port < *base + DEVICE_WINDOW)
            .map(|(base, dev)| (dev, port - *base))
    }

    /// Port read; `None` when no device claims the port.
    pub fn read(&mut self, port: u16, size: u8) -> Option<u32> {
        let (dev, offset) = self.route(port)?;
        Some(dev.io_read(offset, size))
    }

    /// Port write; returns the interrupt vector to inject when the write
    /// produced guest-visible work. `None` when no device claims the port.
    pub fn write(&mut self, port: u16, value: u32, size: u8, ram: &GuestRam) -> Option<Option<u8>> {
        let (dev, offset) = self.route(port)?;
        let vector = dev.irq_vector();
        match dev.io_write(offset, value, size, ram) {
            Ok(true) => Some(Some(vector)),
            Ok(false) => Some(None),
            Err(_) => Some(None), // violation already latched in the status byte
        }
    }
}

impl Default for LegacyIoBus {
    fn default() -> Self {
        Self::new()
    }
}
