//! Virtio block back-end
//!
//! Demultiplexes guest requests into the storage callback: reads, writes,
//! flush, device-id queries, discard and write-zeroes. Each request is a
//! descriptor chain of a 16-byte header, zero or more data buffers and a
//! one-byte status trailer; the used-ring byte count covers everything the
//! device wrote into guest memory.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use static_assertions::const_assert_eq;

use purevisor_hal::storage::{BlockDevice, BlockRequest};

use crate::virtio::{VirtioBackend, VirtioError, F_EVENT_IDX};
use crate::virtqueue::{DescChain, DescFlags, VirtqDesc, Virtqueue, VirtqueueError};
use crate::vm::GuestRam;

/// Virtio sector size; request offsets are in these units.
pub const SECTOR_SIZE: u64 = 512;

// Request types
pub const BLK_T_IN: u32 = 0;
pub const BLK_T_OUT: u32 = 1;
pub const BLK_T_FLUSH: u32 = 4;
pub const BLK_T_GET_ID: u32 = 8;
pub const BLK_T_DISCARD: u32 = 11;
pub const BLK_T_WRITE_ZEROES: u32 = 13;

// Status trailer values
pub const BLK_S_OK: u8 = 0;
pub const BLK_S_IOERR: u8 = 1;
pub const BLK_S_UNSUPP: u8 = 2;

// Device feature bits
const BLK_F_FLUSH: u64 = 1 << 9;
const BLK_F_DISCARD: u64 = 1 << 13;
const BLK_F_WRITE_ZEROES: u64 = 1 << 14;

/// Bytes in the fixed request header.
const HEADER_LEN: usize = 16;
/// Bytes in one discard/write-zeroes segment.
const SEGMENT_LEN: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

const_assert_eq!(core::mem::size_of::<BlkReqHeader>(), HEADER_LEN);

/// Block device model state.
pub struct VirtioBlk {
    disk: Box<dyn BlockDevice + Send>,
    serial: [u8; 20],
}

impl VirtioBlk {
    pub fn new(disk: Box<dyn BlockDevice + Send>, serial: &str) -> Self {
        let mut id = [0u8; 20];
        let n = serial.len().min(20);
        id[..n].copy_from_slice(&serial.as_bytes()[..n]);
        VirtioBlk { disk, serial: id }
    }

    /// Capacity in sectors, as exposed through device configuration.
    fn capacity_sectors(&self) -> u64 {
        self.disk.info().capacity / SECTOR_SIZE
    }

    fn process_chain(&mut self, chain: &DescChain, ram: &GuestRam) -> Result<u32, VirtqueueError> {
        if chain.len() < 2 {
            return Err(VirtqueueError::BadIndex);
        }
        let header_desc = &chain.descs[0];
        let status_desc = &chain.descs[chain.len() - 1];
        if header_desc.flags & DescFlags::WRITE.bits() != 0
            || status_desc.flags & DescFlags::WRITE.bits() == 0
            || (header_desc.len as usize) < HEADER_LEN
            || status_desc.len < 1
        {
            return Err(VirtqueueError::BadIndex);
        }

        let mut raw = [0u8; HEADER_LEN];
        ram.read(header_desc.addr, &mut raw).map_err(|_| VirtqueueError::BadAddress)?;
        let header = BlkReqHeader {
            req_type: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            reserved: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            sector: u64::from_le_bytes([raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15]]),
        };
        let _ = header.reserved;
        let data = &chain.descs[1..chain.len() - 1];
        let offset = header.sector * SECTOR_SIZE;

        let mut written: u32 = 0;
        let status = match header.req_type {
            BLK_T_IN => {
                let mut ok = BLK_S_OK;
                let mut pos = offset;
                for desc in data.iter().filter(|d| d.flags & DescFlags::WRITE.bits() != 0) {
                    let mut buf = vec![0u8; desc.len as usize];
                    match self.disk.submit(BlockRequest::Read { offset: pos, buf: &mut buf }) {
                        Ok(_) => {
                            ram.write(desc.addr, &buf).map_err(|_| VirtqueueError::BadAddress)?;
                            written += desc.len;
                            pos += desc.len as u64;
                        }
                        Err(_) => {
                            ok = BLK_S_IOERR;
                            break;
                        }
                    }
                }
                ok
            }
            BLK_T_OUT => {
                let mut payload = Vec::new();
                for desc in data.iter().filter(|d| d.flags & DescFlags::WRITE.bits() == 0) {
                    let start = payload.len();
                    payload.resize(start + desc.len as usize, 0);
                    ram.read(desc.addr, &mut payload[start..]).map_err(|_| VirtqueueError::BadAddress)?;
                }
                match self.disk.submit(BlockRequest::Write { offset, buf: &payload }) {
                    Ok(_) => BLK_S_OK,
                    Err(_) => BLK_S_IOERR,
                }
            }
            BLK_T_FLUSH => match self.disk.flush() {
                Ok(()) => BLK_S_OK,
                Err(_) => BLK_S_IOERR,
            },
            BLK_T_GET_ID => match data.iter().find(|d| d.flags & DescFlags::WRITE.bits() != 0) {
                Some(desc) => {
                    let n = (desc.len as usize).min(self.serial.len());
                    ram.write(desc.addr, &self.serial[..n]).map_err(|_| VirtqueueError::BadAddress)?;
                    written += n as u32;
                    BLK_S_OK
                }
                None => BLK_S_IOERR,
            },
            BLK_T_DISCARD | BLK_T_WRITE_ZEROES => {
                self.run_segments(header.req_type, data, ram)?
            }
            _ => BLK_S_UNSUPP,
        };

        ram.write(status_desc.addr, &[status]).map_err(|_| VirtqueueError::BadAddress)?;
        written += 1;
        Ok(written)
    }

    /// Discard and write-zeroes carry 16-byte segments in their data
    /// descriptors instead of payload bytes.
    fn run_segments(
        &mut self,
        req_type: u32,
        data: &[VirtqDesc],
        ram: &GuestRam,
    ) -> Result<u8, VirtqueueError> {
        for desc in data.iter().filter(|d| d.flags & DescFlags::WRITE.bits() == 0) {
            if desc.len as usize % SEGMENT_LEN != 0 {
                return Ok(BLK_S_IOERR);
            }
            let mut raw = vec![0u8; desc.len as usize];
            ram.read(desc.addr, &mut raw).map_err(|_| VirtqueueError::BadAddress)?;
            for seg in raw.chunks_exact(SEGMENT_LEN) {
                let sector = u64::from_le_bytes([seg[0], seg[1], seg[2], seg[3], seg[4], seg[5], seg[6], seg[7]]);
                let num = u32::from_le_bytes([seg[8], seg[9], seg[10], seg[11]]);
                let offset = sector * SECTOR_SIZE;
                let len = num as u64 * SECTOR_SIZE;
                let req = if req_type == BLK_T_DISCARD {
                    BlockRequest::Discard { offset, len }
                } else {
                    BlockRequest::WriteZeroes { offset, len }
                };
                if self.disk.submit(req).is_err() {
                    return Ok(BLK_S_IOERR);
                }
            }
        }
        Ok(BLK_S_OK)
    }
}

impl VirtioBackend for VirtioBlk {
    fn device_type(&self) -> u16 {
        2
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn host_features(&self) -> u64 {
        F_EVENT_IDX | BLK_F_FLUSH | BLK_F_DISCARD | BLK_F_WRITE_ZEROES
    }

    /// Configuration layout: capacity in sectors as a little-endian u64.
    fn config_read(&self, offset: u64) -> u8 {
        let capacity = self.capacity_sectors().to_le_bytes();
        capacity.get(offset as usize).copied().unwrap_or(0)
    }

    fn queue_notify(
        &mut self,
        queue: u16,
        queues: &mut [Virtqueue],
        ram: &GuestRam,
    ) -> Result<bool, VirtioError> {
        let q = queues.get_mut(queue as usize).ok_or(VirtioError::BadQueue)?;
        let mut pushed = false;
        while let Some(chain) = q.pop(ram)? {
            let written = self.process_chain(&chain, ram)?;
            q.push(ram, chain.head, written)?;
            pushed = true;
        }
        Ok(pushed && q.should_notify(ram))
    }
}
