//! Interrupt injection contract
//!
//! Device back-ends signal guests through this trait after publishing work
//! to a used ring. The concrete implementation programs the local APIC and
//! the VM-entry interruption fields; tests record the injections.

use crate::cpu::VcpuId;

/// Interrupt vector number
pub type InterruptVector = u8;

/// Sink for interrupts destined to a guest VCPU.
pub trait InterruptInjector {
    /// Queue `vector` for delivery to `vcpu` at its next entry.
    fn inject(&self, vcpu: VcpuId, vector: InterruptVector);
}

/// Injector that drops everything, for contexts with no guest attached.
pub struct NullInjector;

impl InterruptInjector for NullInjector {
    fn inject(&self, _vcpu: VcpuId, _vector: InterruptVector) {}
}
