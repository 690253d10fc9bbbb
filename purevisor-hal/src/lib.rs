#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Hardware Abstraction Layer for the PureVisor hypervisor
//!
//! This crate provides the narrow hardware interface the core consumes:
//! address types and the frame allocator contract, the saved register file,
//! clock and interrupt-injection traits, the block/network back-end traits,
//! and the Intel VT-x primitives (VMCS region management, capability MSR
//! decoding, the entry/exit stub). Everything privileged lives behind
//! `#[cfg(target_arch = "x86_64")]`; the data structures and pure helpers
//! compile and run anywhere, which is what the hosted test suite relies on.

extern crate alloc;

pub mod cpu;
pub mod interrupts;
pub mod memory;
pub mod net;
pub mod storage;
pub mod time;

pub mod arch;

// Re-export core types
pub use cpu::{CpuFeatures, GprState, VcpuId, VmId};
pub use interrupts::InterruptInjector;
pub use memory::{FrameAllocator, HostMap, MemoryFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use net::{NetBackend, NetError, RxSink};
pub use storage::{BlockDevice, BlockDeviceInfo, BlockError, BlockRequest};
pub use time::Clock;

/// Initialize the HAL for the current architecture.
///
/// Probes for VT-x and returns `HardwareNotSupported` when the processor
/// cannot host guests. On non-x86 targets this always fails.
pub fn init() -> Result<(), HalError> {
    #[cfg(target_arch = "x86_64")]
    {
        if !arch::x86_64::vmx::is_supported() {
            return Err(HalError::HardwareNotSupported);
        }
        return Ok(());
    }
    #[allow(unreachable_code)]
    Err(HalError::HardwareNotSupported)
}

/// HAL error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    HardwareNotSupported,
    InitializationFailed,
    InvalidParameter,
    ResourceExhausted,
}
