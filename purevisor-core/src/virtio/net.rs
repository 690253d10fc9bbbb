//! Virtio network back-end
//!
//! Queue 0 is RX toward the guest, queue 1 is TX from the guest. Every
//! packet travels behind a 10-byte header. TX concatenates the readable
//! descriptors (the header rides at the front of the first) and hands the
//! frame to the plugged-in back-end; RX fills a guest-posted chain with a
//! zeroed header plus the frame. The loopback back-end reflects TX frames
//! straight onto its own RX path.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use static_assertions::const_assert_eq;

use purevisor_hal::net::{NetBackend, NetError, RxSink};

use crate::virtio::{VirtioBackend, VirtioError, F_EVENT_IDX};
use crate::virtqueue::{DescFlags, Virtqueue};
use crate::vm::GuestRam;

/// RX virtqueue index.
pub const QUEUE_RX: u16 = 0;
/// TX virtqueue index.
pub const QUEUE_TX: u16 = 1;

/// Feature bit: the device reports a stable MAC in configuration space.
const NET_F_MAC: u64 = 1 << 5;

/// Largest frame the model accepts (no segmentation offloads).
pub const MAX_FRAME: usize = 65535;

/// Per-packet header preceding every frame in both directions.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

pub const NET_HDR_LEN: usize = 10;
const_assert_eq!(core::mem::size_of::<VirtioNetHdr>(), NET_HDR_LEN);

/// Frames waiting to enter the guest, shared with the inbound path.
type RxQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// Inbound hook handed to external receivers.
pub struct NetRxSink {
    queue: RxQueue,
}

impl RxSink for NetRxSink {
    fn receive(&mut self, frame: &[u8]) {
        if frame.len() <= MAX_FRAME {
            self.queue.lock().push_back(frame.to_vec());
        }
    }
}

/// Back-end that reflects transmitted frames onto the RX queue.
pub struct LoopbackBackend {
    rx: RxQueue,
}

impl NetBackend for LoopbackBackend {
    fn transmit(&mut self, frame: &[u8]) -> Result<(), NetError> {
        if frame.len() > MAX_FRAME {
            return Err(NetError::FrameTooLarge);
        }
        self.rx.lock().push_back(frame.to_vec());
        Ok(())
    }
}

/// Network device model state.
pub struct VirtioNet {
    backend: Box<dyn NetBackend + Send>,
    mac: [u8; 6],
    rx_pending: RxQueue,
}

impl VirtioNet {
    pub fn new(backend: Box<dyn NetBackend + Send>, mac: [u8; 6]) -> Self {
        VirtioNet { backend, mac, rx_pending: Arc::new(Mutex::new(VecDeque::new())) }
    }

    /// Loopback configuration: TX frames come back as RX frames.
    pub fn new_loopback(mac: [u8; 6]) -> Self {
        let rx = Arc::new(Mutex::new(VecDeque::new()));
        VirtioNet {
            backend: Box::new(LoopbackBackend { rx: rx.clone() }),
            mac,
            rx_pending: rx,
        }
    }

    /// Hook for the external receive path.
    pub fn rx_sink(&self) -> NetRxSink {
        NetRxSink { queue: self.rx_pending.clone() }
    }

    /// Move pending frames into guest RX buffers. Returns whether used
    /// entries were pushed that warrant an interrupt.
    pub fn deliver_rx(&mut self, queues: &mut [Virtqueue], ram: &GuestRam) -> Result<bool, VirtioError> {
        let rx = queues.get_mut(QUEUE_RX as usize).ok_or(VirtioError::BadQueue)?;
        if !rx.is_ready() {
            return Ok(false);
        }
        let mut pushed = false;
        loop {
            let frame = {
                let mut pending = self.rx_pending.lock();
                match pending.pop_front() {
                    Some(f) => f,
                    None => break,
                }
            };
            let chain = match rx.pop(ram)? {
                Some(c) => c,
                None => {
                    // No guest buffer; requeue and retry on the next kick.
                    self.rx_pending.lock().push_front(frame);
                    break;
                }
            };
            let total = NET_HDR_LEN + frame.len();
            if chain.write_capacity() < total as u64 {
                log_warn!("virtio-net: RX chain too small for {} byte frame, dropped", frame.len());
                rx.push(ram, chain.head, 0)?;
                pushed = true;
                continue;
            }
            let mut payload = Vec::with_capacity(total);
            payload.extend_from_slice(&[0u8; NET_HDR_LEN]);
            payload.extend_from_slice(&frame);
            let mut offset = 0usize;
            for desc in chain.writable() {
                if offset == payload.len() {
                    break;
                }
                let n = (desc.len as usize).min(payload.len() - offset);
                ram.write(desc.addr, &payload[offset..offset + n])
                    .map_err(|_| VirtioError::Protocol(crate::virtqueue::VirtqueueError::BadAddress))?;
                offset += n;
            }
            rx.push(ram, chain.head, total as u32)?;
            pushed = true;
        }
        Ok(pushed && rx.should_notify(ram))
    }

    fn transmit_chain(&mut self, queues: &mut [Virtqueue], ram: &GuestRam) -> Result<bool, VirtioError> {
        let tx = queues.get_mut(QUEUE_TX as usize).ok_or(VirtioError::BadQueue)?;
        let mut pushed = false;
        while let Some(chain) = tx.pop(ram)? {
            let mut frame = Vec::new();
            let mut skip = NET_HDR_LEN;
            for desc in chain.descs.iter().filter(|d| d.flags & DescFlags::WRITE.bits() == 0) {
                let mut buf = alloc::vec![0u8; desc.len as usize];
                ram.read(desc.addr, &mut buf)
                    .map_err(|_| VirtioError::Protocol(crate::virtqueue::VirtqueueError::BadAddress))?;
                let start = skip.min(buf.len());
                skip -= start;
                frame.extend_from_slice(&buf[start..]);
            }
            if let Err(err) = self.backend.transmit(&frame) {
                log_warn!("virtio-net: transmit failed {:?}", err);
            }
            tx.push(ram, chain.head, 0)?;
            pushed = true;
        }
        Ok(pushed && tx.should_notify(ram))
    }
}

impl VirtioBackend for VirtioNet {
    fn device_type(&self) -> u16 {
        1
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn host_features(&self) -> u64 {
        F_EVENT_IDX | NET_F_MAC
    }

    /// Configuration layout: MAC address, then link status (always up).
    fn config_read(&self, offset: u64) -> u8 {
        match offset {
            0..=5 => self.mac[offset as usize],
            6 => 1, // VIRTIO_NET_S_LINK_UP, low byte
            7 => 0,
            _ => 0,
        }
    }

    fn queue_notify(
        &mut self,
        queue: u16,
        queues: &mut [Virtqueue],
        ram: &GuestRam,
    ) -> Result<bool, VirtioError> {
        match queue {
            QUEUE_TX => {
                let tx_irq = self.transmit_chain(queues, ram)?;
                // Loopback traffic lands on RX immediately.
                let rx_irq = self.deliver_rx(queues, ram)?;
                Ok(tx_irq || rx_irq)
            }
            QUEUE_RX => self.deliver_rx(queues, ram),
            _ => Err(VirtioError::BadQueue),
        }
    }

    fn poll(&mut self, queues: &mut [Virtqueue], ram: &GuestRam) -> Result<bool, VirtioError> {
        self.deliver_rx(queues, ram)
    }
}
