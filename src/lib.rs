#![no_std]

//! PureVisor: hyperconverged Type-1 hypervisor engine
//!
//! Facade crate tying the core subsystems to the hardware layer. The
//! interesting machinery lives in `purevisor-core` (virtualization,
//! virtio, pooled storage, the replicated log, placement) and
//! `purevisor-hal` (VT-x primitives and hardware traits); this crate
//! re-exports the public surface and supplies the bare-metal VCPU runner
//! that the core's entry loop drives.

extern crate alloc;

pub mod hv;

pub use purevisor_core::cluster;
pub use purevisor_core::config::CoreConfig;
pub use purevisor_core::dispatch;
pub use purevisor_core::gpt;
pub use purevisor_core::placement;
pub use purevisor_core::storage;
pub use purevisor_core::vcb;
pub use purevisor_core::vcpu;
pub use purevisor_core::virtio;
pub use purevisor_core::virtqueue;
pub use purevisor_core::vm;
pub use purevisor_core::vm_manager;
pub use purevisor_core::CoreError;
pub use purevisor_hal as hal;

/// Top-level initialization: verify the processor can host guests.
///
/// Per-CPU VMX enablement happens later, once the boot environment hands
/// over a VMXON frame for each core.
pub fn init() -> Result<(), PurevisorError> {
    purevisor_hal::init().map_err(PurevisorError::Hal)?;
    purevisor_core::log::enable_uart();
    Ok(())
}

/// PureVisor error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurevisorError {
    Hal(purevisor_hal::HalError),
    Core(CoreError),
}

impl From<CoreError> for PurevisorError {
    fn from(err: CoreError) -> Self {
        PurevisorError::Core(err)
    }
}
