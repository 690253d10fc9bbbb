//! Intel VT-x enablement, capability negotiation and the entry/exit stub
//!
//! Capability words come from the IA32_VMX_* MSRs; each 64-bit word packs
//! the bits a control field must have set (low half) and the bits it may
//! have set (high half). `CtrlCaps::apply` folds a requested word through
//! that intersection and reports `ControlNotSupported` when a mandatory
//! bit cannot be honored, which aborts VM start.

use crate::cpu::GprState;
use crate::memory::PhysicalAddress;

/// VMX errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    NotSupported,
    VmxonFailed,
    VmxoffFailed,
    EntryFailed,
    InveptFailed,
}

/// A mandatory control bit is outside the hardware-allowed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlError {
    /// Bits that were required but are not permitted.
    pub missing: u32,
}

// Basic exit reasons (Intel SDM Vol. 3, Appendix C)
pub const EXIT_REASON_EXTERNAL_INTERRUPT: u32 = 1;
pub const EXIT_REASON_TRIPLE_FAULT: u32 = 2;
pub const EXIT_REASON_CPUID: u32 = 10;
pub const EXIT_REASON_HLT: u32 = 12;
pub const EXIT_REASON_VMCALL: u32 = 18;
pub const EXIT_REASON_CR_ACCESS: u32 = 28;
pub const EXIT_REASON_IO_INSTRUCTION: u32 = 30;
pub const EXIT_REASON_RDMSR: u32 = 31;
pub const EXIT_REASON_WRMSR: u32 = 32;
pub const EXIT_REASON_EPT_VIOLATION: u32 = 48;

// Pin-based execution controls
pub const PIN_EXTERNAL_INTERRUPT_EXIT: u32 = 1 << 0;
pub const PIN_NMI_EXIT: u32 = 1 << 3;

// Primary processor-based execution controls
pub const CPU_HLT_EXIT: u32 = 1 << 7;
pub const CPU_USE_IO_BITMAPS: u32 = 1 << 25;
pub const CPU_USE_MSR_BITMAPS: u32 = 1 << 28;
pub const CPU_SECONDARY_CONTROLS: u32 = 1 << 31;

// Secondary processor-based execution controls
pub const CPU2_ENABLE_EPT: u32 = 1 << 1;
pub const CPU2_ENABLE_VPID: u32 = 1 << 5;
pub const CPU2_UNRESTRICTED_GUEST: u32 = 1 << 7;

// VM-exit controls
pub const EXIT_HOST_ADDR_SPACE_64: u32 = 1 << 9;
pub const EXIT_ACK_INTERRUPT: u32 = 1 << 15;
pub const EXIT_SAVE_EFER: u32 = 1 << 20;
pub const EXIT_LOAD_EFER: u32 = 1 << 21;

// VM-entry controls
pub const ENTRY_IA32E_GUEST: u32 = 1 << 9;
pub const ENTRY_LOAD_EFER: u32 = 1 << 15;

// Capability MSR numbers
const IA32_VMX_BASIC: u32 = 0x480;
const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
const IA32_VMX_EXIT_CTLS: u32 = 0x483;
const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
const IA32_VMX_CR0_FIXED0: u32 = 0x486;
const IA32_VMX_CR0_FIXED1: u32 = 0x487;
const IA32_VMX_CR4_FIXED0: u32 = 0x488;
const IA32_VMX_CR4_FIXED1: u32 = 0x489;
const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;

/// Allowed-0 / allowed-1 pair for one control word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtrlCaps {
    /// Bits the hardware forces to 1.
    pub fixed1: u32,
    /// Bits the hardware permits to be 1.
    pub permitted: u32,
}

impl CtrlCaps {
    pub const fn from_msr(value: u64) -> Self {
        CtrlCaps { fixed1: value as u32, permitted: (value >> 32) as u32 }
    }

    /// Fold `requested` through the allowed range. Bits in `required` that
    /// end up cleared make the whole operation fail.
    pub fn apply(&self, requested: u32, required: u32) -> Result<u32, ControlError> {
        let value = (requested | self.fixed1) & self.permitted;
        let missing = required & !value;
        if missing != 0 {
            return Err(ControlError { missing });
        }
        Ok(value)
    }
}

/// Snapshot of the hardware's virtualization capabilities.
///
/// Read from MSRs on the boot path; tests construct a permissive synthetic
/// instance since capability MSR reads are privileged.
#[derive(Debug, Clone, Copy)]
pub struct VmxCapabilities {
    pub revision_id: u32,
    pub pin_based: CtrlCaps,
    pub cpu_based: CtrlCaps,
    pub secondary: CtrlCaps,
    pub vm_exit: CtrlCaps,
    pub vm_entry: CtrlCaps,
    pub ept_vpid: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
}

impl VmxCapabilities {
    /// Read capability MSRs. Requires ring 0 with CPUID.1:ECX.VMX set.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn read() -> Self {
        use x86::msr::rdmsr;
        // SAFETY: caller guarantees ring 0 and VMX presence.
        unsafe {
            VmxCapabilities {
                revision_id: (rdmsr(IA32_VMX_BASIC) & 0x7FFF_FFFF) as u32,
                pin_based: CtrlCaps::from_msr(rdmsr(IA32_VMX_PINBASED_CTLS)),
                cpu_based: CtrlCaps::from_msr(rdmsr(IA32_VMX_PROCBASED_CTLS)),
                secondary: CtrlCaps::from_msr(rdmsr(IA32_VMX_PROCBASED_CTLS2)),
                vm_exit: CtrlCaps::from_msr(rdmsr(IA32_VMX_EXIT_CTLS)),
                vm_entry: CtrlCaps::from_msr(rdmsr(IA32_VMX_ENTRY_CTLS)),
                ept_vpid: rdmsr(IA32_VMX_EPT_VPID_CAP),
                cr0_fixed0: rdmsr(IA32_VMX_CR0_FIXED0),
                cr0_fixed1: rdmsr(IA32_VMX_CR0_FIXED1),
                cr4_fixed0: rdmsr(IA32_VMX_CR4_FIXED0),
                cr4_fixed1: rdmsr(IA32_VMX_CR4_FIXED1),
            }
        }
    }

    /// Fully permissive capabilities for hosted tests and dry runs.
    pub const fn synthetic() -> Self {
        let open = CtrlCaps { fixed1: 0, permitted: !0 };
        VmxCapabilities {
            revision_id: 1,
            pin_based: open,
            cpu_based: open,
            secondary: open,
            vm_exit: open,
            vm_entry: open,
            ept_vpid: !0,
            cr0_fixed0: 0,
            cr0_fixed1: !0,
            cr4_fixed0: 0,
            cr4_fixed1: !0,
        }
    }

    pub fn has_unrestricted_guest(&self) -> bool {
        self.secondary.permitted & CPU2_UNRESTRICTED_GUEST != 0
    }

    pub fn has_ept(&self) -> bool {
        self.secondary.permitted & CPU2_ENABLE_EPT != 0
    }
}

/// Whether the processor advertises VMX at all.
pub fn is_supported() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        raw_cpuid::CpuId::new()
            .get_feature_info()
            .map_or(false, |f| f.has_vmx())
    }
    #[cfg(not(target_arch = "x86_64"))]
    false
}

// IA32_FEATURE_CONTROL
const IA32_FEATURE_CONTROL: u32 = 0x3A;
const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;

/// Enter VMX root operation using a prepared 4 KiB VMXON region.
///
/// # Safety
/// Requires ring 0, CR4.VMXE set, and the feature-control MSR unlocked or
/// locked with VMX enabled. The region must carry the revision identifier.
#[cfg(target_arch = "x86_64")]
pub unsafe fn vmxon(region: PhysicalAddress) -> Result<(), VmxError> {
    // SAFETY: forwarded to the caller.
    unsafe { x86::bits64::vmx::vmxon(region) }.map_err(|_| VmxError::VmxonFailed)
}

/// The full per-CPU enablement sequence: feature-control lock handling,
/// CR0/CR4 fixed-bit conformance, CR4.VMXE, revision word, VMXON.
///
/// Runs once per core during bring-up. A firmware that locked the
/// feature-control MSR with VMX disabled makes the core unusable for
/// guests and the sequence reports `NotSupported`.
///
/// # Safety
/// Requires ring 0 on a VMX-capable processor; `vmxon_frame` must be a
/// 4 KiB frame reserved for this CPU and reachable through `map`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enable_current_cpu(
    caps: &VmxCapabilities,
    vmxon_frame: PhysicalAddress,
    map: crate::memory::HostMap,
) -> Result<(), VmxError> {
    use x86::msr::{rdmsr, wrmsr};
    // SAFETY: ring 0 per the caller's contract.
    unsafe {
        let fc = rdmsr(IA32_FEATURE_CONTROL);
        if fc & FEATURE_CONTROL_LOCKED != 0 {
            if fc & FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0 {
                return Err(VmxError::NotSupported);
            }
        } else {
            wrmsr(
                IA32_FEATURE_CONTROL,
                fc | FEATURE_CONTROL_LOCKED | FEATURE_CONTROL_VMX_OUTSIDE_SMX,
            );
        }

        // CR0/CR4 must satisfy the fixed-bit MSRs before VMXON; CR4.VMXE
        // rides in via cr4_fixed0 on every implementation.
        let cr0 = (x86::controlregs::cr0().bits() as u64 | caps.cr0_fixed0) & caps.cr0_fixed1;
        core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        let cr4 = (x86::controlregs::cr4().bits() as u64 | caps.cr4_fixed0 | (1 << 13)) & caps.cr4_fixed1;
        core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));

        core::ptr::write_volatile(map.ptr_of(vmxon_frame) as *mut u32, caps.revision_id);
        vmxon(vmxon_frame)
    }
}

/// Leave VMX root operation.
///
/// # Safety
/// Requires ring 0 in VMX root operation.
#[cfg(target_arch = "x86_64")]
pub unsafe fn vmxoff() -> Result<(), VmxError> {
    // SAFETY: forwarded to the caller.
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| VmxError::VmxoffFailed)
}

/// Invalidate EPT-derived translations for one EPT pointer.
///
/// # Safety
/// Requires VMX root operation and INVEPT support.
#[cfg(target_arch = "x86_64")]
pub unsafe fn invept_single(eptp: u64) -> Result<(), VmxError> {
    let descriptor: [u64; 2] = [eptp, 0];
    let mut rflags: u64;
    // SAFETY: descriptor lives on the stack for the duration of the call.
    unsafe {
        core::arch::asm!(
            "invept {kind}, [{desc}]",
            "pushfq",
            "pop {rf}",
            kind = in(reg) 1u64, // single-context invalidation
            desc = in(reg) descriptor.as_ptr(),
            rf = lateout(reg) rflags,
        );
    }
    // CF or ZF reports failure
    if rflags & 0x41 != 0 {
        return Err(VmxError::InveptFailed);
    }
    Ok(())
}

// Entry/exit stub. The host-RIP field of every control block points at
// `pv_vmexit_stub`; `pv_vmentry` restores the guest register file and
// issues VMLAUNCH or VMRESUME. The GprState offsets are part of this
// contract (asserted in cpu.rs).
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.text
.global pv_vmentry
.global pv_vmexit_stub
pv_vmentry:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    push rdi
    // Host RSP/RIP must match this stack layout on every exit.
    mov rax, 0x6C14
    vmwrite rax, rsp
    mov rax, 0x6C16
    lea rdx, [rip + pv_vmexit_stub]
    vmwrite rax, rdx
    // Latch the launched flag into ZF, then restore the guest file.
    test rsi, rsi
    mov rax, [rdi + 0x78]
    mov cr2, rax
    mov rax, [rdi + 0x00]
    mov rbx, [rdi + 0x08]
    mov rcx, [rdi + 0x10]
    mov rdx, [rdi + 0x18]
    mov rsi, [rdi + 0x20]
    mov rbp, [rdi + 0x30]
    mov r8,  [rdi + 0x38]
    mov r9,  [rdi + 0x40]
    mov r10, [rdi + 0x48]
    mov r11, [rdi + 0x50]
    mov r12, [rdi + 0x58]
    mov r13, [rdi + 0x60]
    mov r14, [rdi + 0x68]
    mov r15, [rdi + 0x70]
    mov rdi, [rdi + 0x28]
    jnz 2f
    vmlaunch
    jmp 3f
2:
    vmresume
3:
    // Only reached when the entry itself failed.
    pop rdi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    mov rax, 1
    ret
pv_vmexit_stub:
    push rdi
    mov rdi, [rsp + 8]
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], rsi
    mov [rdi + 0x30], rbp
    mov [rdi + 0x38], r8
    mov [rdi + 0x40], r9
    mov [rdi + 0x48], r10
    mov [rdi + 0x50], r11
    mov [rdi + 0x58], r12
    mov [rdi + 0x60], r13
    mov [rdi + 0x68], r14
    mov [rdi + 0x70], r15
    mov rax, cr2
    mov [rdi + 0x78], rax
    pop rax
    mov [rdi + 0x28], rax
    add rsp, 8
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    xor eax, eax
    ret
"#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn pv_vmentry(gprs: *mut GprState, launched: u64) -> u64;
    /// Exit landing point; its address goes into the host-RIP field.
    pub fn pv_vmexit_stub();
}

/// Address of the exit stub for host-state population.
#[cfg(target_arch = "x86_64")]
pub fn exit_stub_address() -> u64 {
    pv_vmexit_stub as usize as u64
}

/// Run the current VMCS's guest until it exits.
///
/// `launched` selects VMLAUNCH (first entry) against VMRESUME.
///
/// # Safety
/// A fully populated VMCS must be current on this CPU and `gprs` must hold
/// the guest register file.
#[cfg(target_arch = "x86_64")]
pub unsafe fn enter_guest(gprs: &mut GprState, launched: bool) -> Result<(), VmxError> {
    // SAFETY: contract forwarded to the caller.
    let failed = unsafe { pv_vmentry(gprs as *mut GprState, launched as u64) };
    if failed != 0 {
        return Err(VmxError::EntryFailed);
    }
    Ok(())
}
