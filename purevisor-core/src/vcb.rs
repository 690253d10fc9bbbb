//! Virtualization control block population
//!
//! Builds the per-VCPU control-block mirror in four phases: identify,
//! host section, guest section, controls. Every control word is folded
//! through the hardware-allowed ranges; a mandatory bit outside the range
//! reports `ControlNotSupported` and aborts VM start. The hardware region
//! itself is written in one flush pass by the entry path once the mirror
//! is complete.

use purevisor_hal::arch::x86_64::vmx::{
    self, VmxCapabilities, CPU2_ENABLE_EPT, CPU2_UNRESTRICTED_GUEST, CPU_HLT_EXIT,
    CPU_SECONDARY_CONTROLS, CPU_USE_IO_BITMAPS, CPU_USE_MSR_BITMAPS, ENTRY_LOAD_EFER,
    EXIT_ACK_INTERRUPT, EXIT_HOST_ADDR_SPACE_64, EXIT_LOAD_EFER, EXIT_SAVE_EFER,
    PIN_EXTERNAL_INTERRUPT_EXIT, PIN_NMI_EXIT,
};
use purevisor_hal::arch::x86_64::{GuestState, HostState, Segment, TableRegister};

use crate::vcpu::Vcpu;

// CR0 bits
const CR0_PE: u64 = 1 << 0;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_NW: u64 = 1 << 29;
const CR0_CD: u64 = 1 << 30;

// CR4 bits
const CR4_VMXE: u64 = 1 << 13;

// RFLAGS mandatory reserved bit
const RFLAGS_RESERVED: u64 = 1 << 1;

/// Hypercall / CPUID identification leaf returned for leaf 0x4000_0000.
pub const HYPERVISOR_SIGNATURE: [u8; 12] = *b"PureVisorVMM";

/// Control-block population errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcbError {
    /// A required control bit lies outside the hardware-allowed range.
    ControlNotSupported { missing: u32 },
    OutOfMemory,
}

/// Populate the control-block mirror of `vcpu`.
///
/// `host` carries the captured host state with the exit stub and this
/// VCPU's exit stack already filled in; `gpt_pointer` is the hardware
/// pointer of the VM's nested translation table.
pub fn populate(vcpu: &mut Vcpu, caps: &VmxCapabilities, host: &HostState, gpt_pointer: u64) -> Result<(), VcbError> {
    // Phase 1: identify. The revision word is the first 32-bit word of the
    // region; the entry path writes it before VMCLEAR/VMPTRLD.
    vcpu.image.revision_id = caps.revision_id;

    // Phase 2: host section, restored by the processor on every exit.
    vcpu.image.host = *host;
    vcpu.image.host.rsp = vcpu.stack_top();

    // Phase 3: guest section. Fresh VCPUs get a protected-mode-compatible
    // rendition of real mode with execution starting at the boot sector
    // address.
    vcpu.image.guest = reset_guest_state();
    vcpu.image.controls.cr0_shadow = vcpu.image.guest.cr0;
    vcpu.image.controls.cr4_shadow = vcpu.image.guest.cr4;
    // Host-owned control-register bits: cache disables and the FPU error
    // reporting mode in CR0, the VMX enable bit in CR4. Guest writes to
    // these bits exit.
    vcpu.image.controls.cr0_mask = CR0_CD | CR0_NW | CR0_NE;
    vcpu.image.controls.cr4_mask = CR4_VMXE;

    // Phase 4: controls, folded through the capability words.
    let controls = &mut vcpu.image.controls;
    let pin_req = PIN_EXTERNAL_INTERRUPT_EXIT | PIN_NMI_EXIT;
    controls.pin_based = caps.pin_based.apply(pin_req, pin_req).map_err(to_vcb_error)?;

    let cpu_req = CPU_HLT_EXIT | CPU_USE_IO_BITMAPS | CPU_USE_MSR_BITMAPS | CPU_SECONDARY_CONTROLS;
    controls.cpu_based = caps.cpu_based.apply(cpu_req, cpu_req).map_err(to_vcb_error)?;

    let mut cpu2_req = CPU2_ENABLE_EPT;
    if caps.has_unrestricted_guest() {
        cpu2_req |= CPU2_UNRESTRICTED_GUEST;
    }
    controls.secondary = caps.secondary.apply(cpu2_req, CPU2_ENABLE_EPT).map_err(to_vcb_error)?;

    let exit_req = EXIT_HOST_ADDR_SPACE_64 | EXIT_SAVE_EFER | EXIT_LOAD_EFER | EXIT_ACK_INTERRUPT;
    controls.vm_exit = caps.vm_exit.apply(exit_req, exit_req).map_err(to_vcb_error)?;

    let entry_req = ENTRY_LOAD_EFER;
    controls.vm_entry = caps.vm_entry.apply(entry_req, entry_req).map_err(to_vcb_error)?;

    // No exception intercepts by default.
    controls.exception_bitmap = 0;

    controls.ept_pointer = gpt_pointer;
    controls.io_bitmap_a = vcpu.io_bitmap_a;
    controls.io_bitmap_b = vcpu.io_bitmap_b;
    controls.msr_bitmap = vcpu.msr_bitmap;
    controls.link_pointer = !0;
    controls.vpid = (vcpu.id as u16).wrapping_add(1);
    Ok(())
}

fn to_vcb_error(err: vmx::ControlError) -> VcbError {
    VcbError::ControlNotSupported { missing: err.missing }
}

/// The protected-mode-compatible emulation of the real-mode reset state.
pub fn reset_guest_state() -> GuestState {
    let data = Segment { selector: 0, base: 0, limit: 0xFFFF, access: 0x93 };
    let code = Segment { selector: 0, base: 0, limit: 0xFFFF, access: 0x9B };
    GuestState {
        cr0: CR0_PE | CR0_NE | CR0_ET,
        cr3: 0,
        cr4: CR4_VMXE,
        dr7: 0x400,
        rsp: 0,
        rip: 0x7C00,
        rflags: RFLAGS_RESERVED,
        efer: 0,
        pat: 0x0007_0406_0007_0406,
        debugctl: 0,
        sysenter_cs: 0,
        sysenter_esp: 0,
        sysenter_eip: 0,
        es: data,
        cs: code,
        ss: data,
        ds: data,
        fs: data,
        gs: data,
        ldtr: Segment { selector: 0, base: 0, limit: 0xFFFF, access: 0x82 },
        tr: Segment { selector: 0, base: 0, limit: 0xFFFF, access: 0x8B },
        gdtr: TableRegister::default(),
        idtr: TableRegister::default(),
        interruptibility: 0,
        activity_state: 0,
    }
}

/// Consistency checks a populated guest section must satisfy before entry.
///
/// Covers the access-rights/CR0/RFLAGS coupling the hardware enforces at
/// entry time; the full entry checks live in silicon.
pub fn guest_state_consistent(guest: &GuestState) -> bool {
    if guest.rflags & RFLAGS_RESERVED == 0 {
        return false;
    }
    let protected = guest.cr0 & CR0_PE != 0;
    let cs_present = guest.cs.access & 0x80 != 0;
    if !cs_present {
        return false;
    }
    // Code segment must be marked executable
    if guest.cs.access & 0x8 == 0 {
        return false;
    }
    // Outside protected mode only the real-mode-style flat segments are
    // coherent; the hardware rejects anything else without unrestricted
    // guest mode.
    if !protected && (guest.cs.base != 0 || guest.cs.limit != 0xFFFF) {
        return false;
    }
    true
}
