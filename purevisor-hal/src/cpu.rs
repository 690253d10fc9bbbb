//! CPU state shared between the entry stub and the exit dispatcher

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Virtual machine handle
pub type VmId = u32;

/// Virtual CPU handle
pub type VcpuId = u32;

/// Guest general-purpose registers the hardware does not save for us.
///
/// The VM-entry stub restores these immediately before VMLAUNCH/VMRESUME
/// and the exit stub saves them straight from the hardware registers, so
/// the layout is part of the assembly contract: field offsets are fixed by
/// `#[repr(C)]` and asserted below. RSP and RIP travel in the control block
/// and are absent here. CR2 is included because the hardware neither saves
/// nor restores it across entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GprState {
    pub rax: u64, // 0x00
    pub rbx: u64, // 0x08
    pub rcx: u64, // 0x10
    pub rdx: u64, // 0x18
    pub rsi: u64, // 0x20
    pub rdi: u64, // 0x28
    pub rbp: u64, // 0x30
    pub r8: u64,  // 0x38
    pub r9: u64,  // 0x40
    pub r10: u64, // 0x48
    pub r11: u64, // 0x50
    pub r12: u64, // 0x58
    pub r13: u64, // 0x60
    pub r14: u64, // 0x68
    pub r15: u64, // 0x70
    pub cr2: u64, // 0x78
}

const_assert_eq!(core::mem::size_of::<GprState>(), 0x80);
const_assert_eq!(core::mem::offset_of!(GprState, rdi), 0x28);
const_assert_eq!(core::mem::offset_of!(GprState, r15), 0x70);
const_assert_eq!(core::mem::offset_of!(GprState, cr2), 0x78);

bitflags! {
    /// Processor capabilities relevant to hosting guests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u64 {
        const VMX                = 1 << 0;
        const EPT                = 1 << 1;
        const UNRESTRICTED_GUEST = 1 << 2;
        const VPID               = 1 << 3;
        const EPT_1GB_PAGES      = 1 << 4;
        const INVEPT             = 1 << 5;
    }
}

/// Execute CPUID with the given leaf and subleaf.
///
/// Returns (eax, ebx, ecx, edx). On non-x86 builds this returns zeroes;
/// the dispatcher only runs on x86_64 hardware.
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: CPUID is unprivileged and has no side effects.
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        (r.eax, r.ebx, r.ecx, r.edx)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (leaf, subleaf);
        (0, 0, 0, 0)
    }
}

/// APIC identity of the executing core, used to index per-CPU state.
pub fn current_cpu_id() -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        // Initial APIC id lives in CPUID.1:EBX[31:24].
        let (_, ebx, _, _) = cpuid(1, 0);
        ebx >> 24
    }
    #[cfg(not(target_arch = "x86_64"))]
    0
}
