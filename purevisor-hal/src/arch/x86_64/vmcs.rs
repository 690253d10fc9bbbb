//! VMCS (Virtual Machine Control Structure) management
//!
//! Two layers live here. `Vmcs`/`ActiveVmcs` wrap the VMCLEAR / VMPTRLD /
//! VMREAD / VMWRITE instructions around a 4 KiB control region. On top of
//! that, `VmcsImage` is the in-memory mirror of every field the hypervisor
//! pins: the core populates the mirror with plain stores, then a single
//! `flush` pass writes it into the hardware region before first entry.
//! Keeping the mirror authoritative means population logic and its
//! invariants are exercised without a processor in VMX operation.

use crate::memory::PhysicalAddress;

/// Intel-defined VMCS field encodings used by this hypervisor.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum VmcsField {
    // 16-bit control fields
    VIRTUAL_PROCESSOR_ID = 0x0000,

    // 16-bit guest state
    GUEST_ES_SELECTOR = 0x0800,
    GUEST_CS_SELECTOR = 0x0802,
    GUEST_SS_SELECTOR = 0x0804,
    GUEST_DS_SELECTOR = 0x0806,
    GUEST_FS_SELECTOR = 0x0808,
    GUEST_GS_SELECTOR = 0x080A,
    GUEST_LDTR_SELECTOR = 0x080C,
    GUEST_TR_SELECTOR = 0x080E,

    // 16-bit host state
    HOST_ES_SELECTOR = 0x0C00,
    HOST_CS_SELECTOR = 0x0C02,
    HOST_SS_SELECTOR = 0x0C04,
    HOST_DS_SELECTOR = 0x0C06,
    HOST_FS_SELECTOR = 0x0C08,
    HOST_GS_SELECTOR = 0x0C0A,
    HOST_TR_SELECTOR = 0x0C0C,

    // 64-bit control fields
    IO_BITMAP_A = 0x2000,
    IO_BITMAP_B = 0x2002,
    MSR_BITMAP = 0x2004,
    TSC_OFFSET = 0x2010,
    EPT_POINTER = 0x201A,

    // 64-bit read-only data
    GUEST_PHYSICAL_ADDRESS = 0x2400,

    // 64-bit guest state
    VMCS_LINK_POINTER = 0x2800,
    GUEST_IA32_DEBUGCTL = 0x2802,
    GUEST_IA32_PAT = 0x2804,
    GUEST_IA32_EFER = 0x2806,

    // 64-bit host state
    HOST_IA32_PAT = 0x2C00,
    HOST_IA32_EFER = 0x2C02,

    // 32-bit control fields
    PIN_BASED_VM_EXEC_CONTROL = 0x4000,
    CPU_BASED_VM_EXEC_CONTROL = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    VM_EXIT_CONTROLS = 0x400C,
    VM_ENTRY_CONTROLS = 0x4012,
    VM_ENTRY_INTR_INFO = 0x4016,
    SECONDARY_VM_EXEC_CONTROL = 0x401E,

    // 32-bit read-only data
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VM_EXIT_INTR_INFO = 0x4404,
    VM_EXIT_INSTRUCTION_LEN = 0x440C,

    // 32-bit guest state
    GUEST_ES_LIMIT = 0x4800,
    GUEST_CS_LIMIT = 0x4802,
    GUEST_SS_LIMIT = 0x4804,
    GUEST_DS_LIMIT = 0x4806,
    GUEST_FS_LIMIT = 0x4808,
    GUEST_GS_LIMIT = 0x480A,
    GUEST_LDTR_LIMIT = 0x480C,
    GUEST_TR_LIMIT = 0x480E,
    GUEST_GDTR_LIMIT = 0x4810,
    GUEST_IDTR_LIMIT = 0x4812,
    GUEST_ES_AR_BYTES = 0x4814,
    GUEST_CS_AR_BYTES = 0x4816,
    GUEST_SS_AR_BYTES = 0x4818,
    GUEST_DS_AR_BYTES = 0x481A,
    GUEST_FS_AR_BYTES = 0x481C,
    GUEST_GS_AR_BYTES = 0x481E,
    GUEST_LDTR_AR_BYTES = 0x4820,
    GUEST_TR_AR_BYTES = 0x4822,
    GUEST_INTERRUPTIBILITY = 0x4824,
    GUEST_ACTIVITY_STATE = 0x4826,
    GUEST_SYSENTER_CS = 0x482A,

    // 32-bit host state
    HOST_SYSENTER_CS = 0x4C00,

    // Natural-width control fields
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,

    // Natural-width read-only data
    EXIT_QUALIFICATION = 0x6400,
    GUEST_LINEAR_ADDRESS = 0x640A,

    // Natural-width guest state
    GUEST_CR0 = 0x6800,
    GUEST_CR3 = 0x6802,
    GUEST_CR4 = 0x6804,
    GUEST_ES_BASE = 0x6806,
    GUEST_CS_BASE = 0x6808,
    GUEST_SS_BASE = 0x680A,
    GUEST_DS_BASE = 0x680C,
    GUEST_FS_BASE = 0x680E,
    GUEST_GS_BASE = 0x6810,
    GUEST_LDTR_BASE = 0x6812,
    GUEST_TR_BASE = 0x6814,
    GUEST_GDTR_BASE = 0x6816,
    GUEST_IDTR_BASE = 0x6818,
    GUEST_DR7 = 0x681A,
    GUEST_RSP = 0x681C,
    GUEST_RIP = 0x681E,
    GUEST_RFLAGS = 0x6820,
    GUEST_SYSENTER_ESP = 0x6824,
    GUEST_SYSENTER_EIP = 0x6826,

    // Natural-width host state
    HOST_CR0 = 0x6C00,
    HOST_CR3 = 0x6C02,
    HOST_CR4 = 0x6C04,
    HOST_FS_BASE = 0x6C06,
    HOST_GS_BASE = 0x6C08,
    HOST_TR_BASE = 0x6C0A,
    HOST_GDTR_BASE = 0x6C0C,
    HOST_IDTR_BASE = 0x6C0E,
    HOST_SYSENTER_ESP = 0x6C10,
    HOST_SYSENTER_EIP = 0x6C12,
    HOST_RSP = 0x6C14,
    HOST_RIP = 0x6C16,
}

/// VMCS-related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsError {
    VmclearFailed,
    VmptrldFailed,
    VmreadFailed,
    VmwriteFailed,
}

/// Ownership of a 4 KiB-aligned VMCS region in physical memory.
pub struct Vmcs {
    phys_addr: PhysicalAddress,
}

impl Vmcs {
    pub const fn new(phys: PhysicalAddress) -> Self {
        Self { phys_addr: phys }
    }

    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// Clear launch state with VMCLEAR.
    #[cfg(target_arch = "x86_64")]
    pub fn clear(&self) -> Result<(), VmcsError> {
        // SAFETY: phys_addr names a 4 KiB region reserved for this VMCS.
        unsafe { x86::bits64::vmx::vmclear(self.phys_addr) }.map_err(|_| VmcsError::VmclearFailed)
    }

    /// Make this VMCS current with VMPTRLD, returning the access token.
    #[cfg(target_arch = "x86_64")]
    pub fn load(&self) -> Result<ActiveVmcs<'_>, VmcsError> {
        // SAFETY: region validity as above; the revision word is written by
        // control-block population before first load.
        unsafe { x86::bits64::vmx::vmptrld(self.phys_addr) }.map_err(|_| VmcsError::VmptrldFailed)?;
        Ok(ActiveVmcs { _vmcs: core::marker::PhantomData })
    }
}

/// Token proving a VMCS is current on this CPU; allows VMREAD/VMWRITE.
#[cfg(target_arch = "x86_64")]
pub struct ActiveVmcs<'a> {
    _vmcs: core::marker::PhantomData<&'a Vmcs>,
}

#[cfg(target_arch = "x86_64")]
impl ActiveVmcs<'_> {
    #[inline]
    pub fn read(&self, field: VmcsField) -> Result<u64, VmcsError> {
        // SAFETY: a VMCS is current while this token exists.
        unsafe { x86::bits64::vmx::vmread(field as u32) }.map_err(|_| VmcsError::VmreadFailed)
    }

    #[inline]
    pub fn write(&mut self, field: VmcsField, value: u64) -> Result<(), VmcsError> {
        // SAFETY: as above.
        unsafe { x86::bits64::vmx::vmwrite(field as u32, value) }.map_err(|_| VmcsError::VmwriteFailed)
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub struct ActiveVmcs<'a> {
    _vmcs: core::marker::PhantomData<&'a Vmcs>,
}

/// One segment register as the control block sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// Access-rights byte pair in the VMCS encoding (type, S, DPL, P, ...).
    pub access: u32,
}

impl Segment {
    /// The "unusable" encoding hardware expects for absent segments.
    pub const fn unusable() -> Self {
        Segment { selector: 0, base: 0, limit: 0, access: 1 << 16 }
    }
}

/// Descriptor-table register (GDTR/IDTR).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u32,
}

/// Host-state section: what the processor restores on every VM exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub efer: u64,
    pub pat: u64,
    /// Per-VCPU exit stack.
    pub rsp: u64,
    /// The exit landing stub.
    pub rip: u64,
}

#[cfg(target_arch = "x86_64")]
impl HostState {
    /// Snapshot the executing CPU's state into host fields.
    ///
    /// `exit_rip` is the exit landing stub and `exit_rsp` the per-VCPU
    /// stack top; both are caller-provided because they are per-VCPU, not
    /// per-CPU.
    ///
    /// # Safety
    /// Requires ring 0; reads control registers and MSRs.
    pub unsafe fn capture(exit_rip: u64, exit_rsp: u64) -> Self {
        use x86::msr::rdmsr;
        use x86_64::instructions::segmentation::{Segment as _, CS, DS, ES, FS, GS, SS};
        use x86_64::instructions::tables::{sgdt, sidt};

        const IA32_SYSENTER_CS: u32 = 0x174;
        const IA32_SYSENTER_ESP: u32 = 0x175;
        const IA32_SYSENTER_EIP: u32 = 0x176;
        const IA32_PAT: u32 = 0x277;
        const IA32_EFER: u32 = 0xC000_0080;
        const IA32_FS_BASE: u32 = 0xC000_0100;
        const IA32_GS_BASE: u32 = 0xC000_0101;

        // SAFETY: ring 0 per the caller's contract.
        unsafe {
            HostState {
                cr0: x86::controlregs::cr0().bits() as u64,
                cr3: x86::controlregs::cr3(),
                cr4: x86::controlregs::cr4().bits() as u64,
                es: ES::get_reg().0,
                cs: CS::get_reg().0,
                ss: SS::get_reg().0,
                ds: DS::get_reg().0,
                fs: FS::get_reg().0,
                gs: GS::get_reg().0,
                tr: x86::task::tr().bits(),
                fs_base: rdmsr(IA32_FS_BASE),
                gs_base: rdmsr(IA32_GS_BASE),
                // The boot GDT keeps its TSS at base 0.
                tr_base: 0,
                gdtr_base: sgdt().base.as_u64(),
                idtr_base: sidt().base.as_u64(),
                sysenter_cs: rdmsr(IA32_SYSENTER_CS) as u32,
                sysenter_esp: rdmsr(IA32_SYSENTER_ESP),
                sysenter_eip: rdmsr(IA32_SYSENTER_EIP),
                efer: rdmsr(IA32_EFER),
                pat: rdmsr(IA32_PAT),
                rsp: exit_rsp,
                rip: exit_rip,
            }
        }
    }
}

/// Guest-state section: what the processor loads on every VM entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub efer: u64,
    pub pat: u64,
    pub debugctl: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: TableRegister,
    pub idtr: TableRegister,
    pub interruptibility: u32,
    pub activity_state: u32,
}

/// Execution, exit and entry controls plus the shadow/mask pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Controls {
    pub pin_based: u32,
    pub cpu_based: u32,
    pub secondary: u32,
    pub vm_exit: u32,
    pub vm_entry: u32,
    pub exception_bitmap: u32,
    pub cr0_mask: u64,
    pub cr4_mask: u64,
    pub cr0_shadow: u64,
    pub cr4_shadow: u64,
    pub ept_pointer: u64,
    pub io_bitmap_a: u64,
    pub io_bitmap_b: u64,
    pub msr_bitmap: u64,
    pub vpid: u16,
    pub tsc_offset: u64,
    pub link_pointer: u64,
}

/// Read-only exit information captured after each VM exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitFields {
    pub reason: u32,
    pub qualification: u64,
    pub guest_physical: u64,
    pub guest_linear: u64,
    pub instruction_len: u32,
    pub interruption_info: u32,
    pub instruction_error: u32,
}

/// In-memory mirror of the pinned control-block fields.
///
/// The core owns one per VCPU, populates it while the VCPU is quiescent,
/// and only then flushes it to hardware in one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmcsImage {
    pub revision_id: u32,
    pub host: HostState,
    pub guest: GuestState,
    pub controls: Controls,
    pub exit: ExitFields,
}

#[cfg(target_arch = "x86_64")]
impl VmcsImage {
    /// Write every mirrored field into the current VMCS.
    pub fn flush(&self, vmcs: &mut ActiveVmcs<'_>) -> Result<(), VmcsError> {
        use VmcsField as F;

        // Controls
        vmcs.write(F::PIN_BASED_VM_EXEC_CONTROL, self.controls.pin_based as u64)?;
        vmcs.write(F::CPU_BASED_VM_EXEC_CONTROL, self.controls.cpu_based as u64)?;
        vmcs.write(F::SECONDARY_VM_EXEC_CONTROL, self.controls.secondary as u64)?;
        vmcs.write(F::VM_EXIT_CONTROLS, self.controls.vm_exit as u64)?;
        vmcs.write(F::VM_ENTRY_CONTROLS, self.controls.vm_entry as u64)?;
        vmcs.write(F::EXCEPTION_BITMAP, self.controls.exception_bitmap as u64)?;
        vmcs.write(F::CR0_GUEST_HOST_MASK, self.controls.cr0_mask)?;
        vmcs.write(F::CR4_GUEST_HOST_MASK, self.controls.cr4_mask)?;
        vmcs.write(F::CR0_READ_SHADOW, self.controls.cr0_shadow)?;
        vmcs.write(F::CR4_READ_SHADOW, self.controls.cr4_shadow)?;
        vmcs.write(F::IO_BITMAP_A, self.controls.io_bitmap_a)?;
        vmcs.write(F::IO_BITMAP_B, self.controls.io_bitmap_b)?;
        vmcs.write(F::MSR_BITMAP, self.controls.msr_bitmap)?;
        vmcs.write(F::VIRTUAL_PROCESSOR_ID, self.controls.vpid as u64)?;
        vmcs.write(F::TSC_OFFSET, self.controls.tsc_offset)?;
        vmcs.write(F::VMCS_LINK_POINTER, self.controls.link_pointer)?;
        if self.controls.ept_pointer != 0 {
            vmcs.write(F::EPT_POINTER, self.controls.ept_pointer)?;
        }

        // Host state
        vmcs.write(F::HOST_CR0, self.host.cr0)?;
        vmcs.write(F::HOST_CR3, self.host.cr3)?;
        vmcs.write(F::HOST_CR4, self.host.cr4)?;
        vmcs.write(F::HOST_ES_SELECTOR, self.host.es as u64)?;
        vmcs.write(F::HOST_CS_SELECTOR, self.host.cs as u64)?;
        vmcs.write(F::HOST_SS_SELECTOR, self.host.ss as u64)?;
        vmcs.write(F::HOST_DS_SELECTOR, self.host.ds as u64)?;
        vmcs.write(F::HOST_FS_SELECTOR, self.host.fs as u64)?;
        vmcs.write(F::HOST_GS_SELECTOR, self.host.gs as u64)?;
        vmcs.write(F::HOST_TR_SELECTOR, self.host.tr as u64)?;
        vmcs.write(F::HOST_FS_BASE, self.host.fs_base)?;
        vmcs.write(F::HOST_GS_BASE, self.host.gs_base)?;
        vmcs.write(F::HOST_TR_BASE, self.host.tr_base)?;
        vmcs.write(F::HOST_GDTR_BASE, self.host.gdtr_base)?;
        vmcs.write(F::HOST_IDTR_BASE, self.host.idtr_base)?;
        vmcs.write(F::HOST_SYSENTER_CS, self.host.sysenter_cs as u64)?;
        vmcs.write(F::HOST_SYSENTER_ESP, self.host.sysenter_esp)?;
        vmcs.write(F::HOST_SYSENTER_EIP, self.host.sysenter_eip)?;
        vmcs.write(F::HOST_IA32_EFER, self.host.efer)?;
        vmcs.write(F::HOST_IA32_PAT, self.host.pat)?;
        vmcs.write(F::HOST_RSP, self.host.rsp)?;
        vmcs.write(F::HOST_RIP, self.host.rip)?;

        // Guest state
        vmcs.write(F::GUEST_CR0, self.guest.cr0)?;
        vmcs.write(F::GUEST_CR3, self.guest.cr3)?;
        vmcs.write(F::GUEST_CR4, self.guest.cr4)?;
        vmcs.write(F::GUEST_DR7, self.guest.dr7)?;
        vmcs.write(F::GUEST_RSP, self.guest.rsp)?;
        vmcs.write(F::GUEST_RIP, self.guest.rip)?;
        vmcs.write(F::GUEST_RFLAGS, self.guest.rflags)?;
        vmcs.write(F::GUEST_IA32_EFER, self.guest.efer)?;
        vmcs.write(F::GUEST_IA32_PAT, self.guest.pat)?;
        vmcs.write(F::GUEST_IA32_DEBUGCTL, self.guest.debugctl)?;
        vmcs.write(F::GUEST_SYSENTER_CS, self.guest.sysenter_cs as u64)?;
        vmcs.write(F::GUEST_SYSENTER_ESP, self.guest.sysenter_esp)?;
        vmcs.write(F::GUEST_SYSENTER_EIP, self.guest.sysenter_eip)?;
        vmcs.write(F::GUEST_INTERRUPTIBILITY, self.guest.interruptibility as u64)?;
        vmcs.write(F::GUEST_ACTIVITY_STATE, self.guest.activity_state as u64)?;

        Self::flush_segment(vmcs, &self.guest.es, F::GUEST_ES_SELECTOR, F::GUEST_ES_BASE, F::GUEST_ES_LIMIT, F::GUEST_ES_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.cs, F::GUEST_CS_SELECTOR, F::GUEST_CS_BASE, F::GUEST_CS_LIMIT, F::GUEST_CS_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.ss, F::GUEST_SS_SELECTOR, F::GUEST_SS_BASE, F::GUEST_SS_LIMIT, F::GUEST_SS_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.ds, F::GUEST_DS_SELECTOR, F::GUEST_DS_BASE, F::GUEST_DS_LIMIT, F::GUEST_DS_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.fs, F::GUEST_FS_SELECTOR, F::GUEST_FS_BASE, F::GUEST_FS_LIMIT, F::GUEST_FS_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.gs, F::GUEST_GS_SELECTOR, F::GUEST_GS_BASE, F::GUEST_GS_LIMIT, F::GUEST_GS_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.ldtr, F::GUEST_LDTR_SELECTOR, F::GUEST_LDTR_BASE, F::GUEST_LDTR_LIMIT, F::GUEST_LDTR_AR_BYTES)?;
        Self::flush_segment(vmcs, &self.guest.tr, F::GUEST_TR_SELECTOR, F::GUEST_TR_BASE, F::GUEST_TR_LIMIT, F::GUEST_TR_AR_BYTES)?;

        vmcs.write(F::GUEST_GDTR_BASE, self.guest.gdtr.base)?;
        vmcs.write(F::GUEST_GDTR_LIMIT, self.guest.gdtr.limit as u64)?;
        vmcs.write(F::GUEST_IDTR_BASE, self.guest.idtr.base)?;
        vmcs.write(F::GUEST_IDTR_LIMIT, self.guest.idtr.limit as u64)?;
        Ok(())
    }

    /// Read back the exit-information fields after a VM exit.
    pub fn capture_exit(&mut self, vmcs: &ActiveVmcs<'_>) -> Result<(), VmcsError> {
        use VmcsField as F;
        self.exit.reason = vmcs.read(F::EXIT_REASON)? as u32;
        self.exit.qualification = vmcs.read(F::EXIT_QUALIFICATION)?;
        self.exit.guest_physical = vmcs.read(F::GUEST_PHYSICAL_ADDRESS)?;
        self.exit.guest_linear = vmcs.read(F::GUEST_LINEAR_ADDRESS)?;
        self.exit.instruction_len = vmcs.read(F::VM_EXIT_INSTRUCTION_LEN)? as u32;
        self.exit.interruption_info = vmcs.read(F::VM_EXIT_INTR_INFO)? as u32;
        self.guest.rip = vmcs.read(F::GUEST_RIP)?;
        self.guest.rsp = vmcs.read(F::GUEST_RSP)?;
        self.guest.rflags = vmcs.read(F::GUEST_RFLAGS)?;
        self.guest.cr0 = vmcs.read(F::GUEST_CR0)?;
        self.guest.cr3 = vmcs.read(F::GUEST_CR3)?;
        self.guest.cr4 = vmcs.read(F::GUEST_CR4)?;
        Ok(())
    }

    /// Push mutable guest fields back before re-entering.
    pub fn flush_guest_dynamic(&self, vmcs: &mut ActiveVmcs<'_>) -> Result<(), VmcsError> {
        use VmcsField as F;
        vmcs.write(F::GUEST_RIP, self.guest.rip)?;
        vmcs.write(F::GUEST_RSP, self.guest.rsp)?;
        vmcs.write(F::GUEST_RFLAGS, self.guest.rflags)?;
        vmcs.write(F::GUEST_CR0, self.guest.cr0)?;
        vmcs.write(F::GUEST_CR3, self.guest.cr3)?;
        vmcs.write(F::GUEST_CR4, self.guest.cr4)?;
        vmcs.write(F::GUEST_IA32_EFER, self.guest.efer)?;
        vmcs.write(F::CR0_READ_SHADOW, self.controls.cr0_shadow)?;
        vmcs.write(F::CR4_READ_SHADOW, self.controls.cr4_shadow)?;
        Ok(())
    }

    fn flush_segment(
        vmcs: &mut ActiveVmcs<'_>,
        seg: &Segment,
        sel: VmcsField,
        base: VmcsField,
        limit: VmcsField,
        ar: VmcsField,
    ) -> Result<(), VmcsError> {
        vmcs.write(sel, seg.selector as u64)?;
        vmcs.write(base, seg.base)?;
        vmcs.write(limit, seg.limit as u64)?;
        vmcs.write(ar, seg.access as u64)?;
        Ok(())
    }
}
