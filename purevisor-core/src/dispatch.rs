//! VM-exit dispatcher
//!
//! Every exit lands here with its structured reason and qualification.
//! In-place emulators (CPUID, HLT, MSR and control-register access,
//! hypercalls) advance the guest instruction pointer by the saved
//! exit-instruction length; port I/O delegates to the virtio bus without
//! touching anything beyond the access itself. Handlers return Continue to
//! re-enter the guest or Stop to mark the VM failed.

use purevisor_hal::arch::x86_64::vmx::{
    EXIT_REASON_CPUID, EXIT_REASON_CR_ACCESS, EXIT_REASON_EPT_VIOLATION,
    EXIT_REASON_EXTERNAL_INTERRUPT, EXIT_REASON_HLT, EXIT_REASON_IO_INSTRUCTION,
    EXIT_REASON_RDMSR, EXIT_REASON_TRIPLE_FAULT, EXIT_REASON_VMCALL, EXIT_REASON_WRMSR,
};
use purevisor_hal::cpu::cpuid;

use crate::vcb::HYPERVISOR_SIGNATURE;
use crate::vcpu::{Vcpu, VcpuPhase};
use crate::vm::Vm;

// MSR numbers the handler whitelists
const MSR_APIC_BASE: u32 = 0x1B;
const MSR_EFER: u32 = 0xC000_0080;
const MSR_FS_BASE: u32 = 0xC000_0100;
const MSR_GS_BASE: u32 = 0xC000_0101;

// CPUID.1:ECX feature bits masked from guests
const CPUID_ECX_VMX: u32 = 1 << 5;
const CPUID_ECX_HYPERVISOR: u32 = 1 << 31;

/// CPUID leaf reserved for hypervisor identification.
pub const CPUID_HV_LEAF: u32 = 0x4000_0000;

// Hypercall indices (guest A register selects, result returns in A)
pub const HC_PROBE: u64 = 0;
pub const HC_VERSION: u64 = 1;
pub const HC_LOG_BYTE: u64 = 2;

/// Magic returned by `HC_PROBE`.
pub const HC_PROBE_MAGIC: u64 = 0x5056_4D4D; // "PVMM"

/// Decoded port I/O exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExit {
    pub port: u16,
    pub width: u8,
    pub is_in: bool,
    pub string_op: bool,
    pub rep: bool,
}

/// Control-register access kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessKind {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Decoded control-register exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrExit {
    pub cr: u8,
    pub kind: CrAccessKind,
    pub gpr: u8,
}

/// Decoded nested-translation fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedFault {
    pub guest_phys: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// Structured exit reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ExternalInterrupt,
    TripleFault,
    Cpuid,
    Hlt,
    Io(IoExit),
    Rdmsr,
    Wrmsr,
    CrAccess(CrExit),
    NestedFault(NestedFault),
    Hypercall,
    Unknown(u32),
}

/// One exit as handed to the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub reason: ExitReason,
    pub raw_reason: u32,
    pub qualification: u64,
    pub instruction_len: u32,
}

impl ExitInfo {
    /// Decode the hardware exit fields into a structured reason.
    pub fn from_raw(raw_reason: u32, qualification: u64, guest_physical: u64, instruction_len: u32) -> Self {
        let basic = raw_reason & 0xFFFF;
        let reason = match basic {
            EXIT_REASON_EXTERNAL_INTERRUPT => ExitReason::ExternalInterrupt,
            EXIT_REASON_TRIPLE_FAULT => ExitReason::TripleFault,
            EXIT_REASON_CPUID => ExitReason::Cpuid,
            EXIT_REASON_HLT => ExitReason::Hlt,
            EXIT_REASON_IO_INSTRUCTION => ExitReason::Io(decode_io(qualification)),
            EXIT_REASON_RDMSR => ExitReason::Rdmsr,
            EXIT_REASON_WRMSR => ExitReason::Wrmsr,
            EXIT_REASON_CR_ACCESS => ExitReason::CrAccess(decode_cr(qualification)),
            EXIT_REASON_EPT_VIOLATION => ExitReason::NestedFault(decode_nested_fault(qualification, guest_physical)),
            EXIT_REASON_VMCALL => ExitReason::Hypercall,
            other => ExitReason::Unknown(other),
        };
        ExitInfo { reason, raw_reason: basic, qualification, instruction_len }
    }
}

/// What the dispatcher tells the entry loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Re-enter the guest.
    Continue,
    /// Fatal; the VM goes to Error.
    Stop,
}

fn decode_io(qual: u64) -> IoExit {
    IoExit {
        port: (qual >> 16) as u16,
        width: (qual & 0x7) as u8 + 1,
        is_in: qual & (1 << 3) != 0,
        string_op: qual & (1 << 4) != 0,
        rep: qual & (1 << 5) != 0,
    }
}

fn decode_cr(qual: u64) -> CrExit {
    CrExit {
        cr: (qual & 0xF) as u8,
        kind: match (qual >> 4) & 0x3 {
            0 => CrAccessKind::MovToCr,
            1 => CrAccessKind::MovFromCr,
            2 => CrAccessKind::Clts,
            _ => CrAccessKind::Lmsw,
        },
        gpr: ((qual >> 8) & 0xF) as u8,
    }
}

fn decode_nested_fault(qual: u64, guest_physical: u64) -> NestedFault {
    NestedFault {
        guest_phys: guest_physical,
        read: qual & 1 != 0,
        write: qual & 2 != 0,
        execute: qual & 4 != 0,
    }
}

/// Dispatch one exit on `vm.vcpus[vcpu_index]`. Exit accounting happens
/// in the entry loop, which owns the cycle counter.
pub fn dispatch(vm: &mut Vm, vcpu_index: usize, exit: &ExitInfo) -> HandlerOutcome {
    match exit.reason {
        ExitReason::Cpuid => {
            handle_cpuid(&mut vm.vcpus[vcpu_index]);
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::Hlt => {
            vm.vcpus[vcpu_index].phase = VcpuPhase::Halted;
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::Io(io) => {
            handle_io(vm, vcpu_index, io);
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::Rdmsr => {
            handle_rdmsr(&mut vm.vcpus[vcpu_index]);
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::Wrmsr => {
            handle_wrmsr(&mut vm.vcpus[vcpu_index]);
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::CrAccess(cr) => {
            let outcome = handle_cr(&mut vm.vcpus[vcpu_index], cr);
            if outcome == HandlerOutcome::Continue {
                advance(&mut vm.vcpus[vcpu_index], exit);
            }
            outcome
        }
        ExitReason::NestedFault(fault) => {
            // All nested-translation faults are fatal for now; a mature
            // implementation would demand-page or MMIO-emulate here.
            log_error!(
                "vm {}: nested fault at {:#x} (r={} w={} x={})",
                vm.id,
                fault.guest_phys,
                fault.read,
                fault.write,
                fault.execute
            );
            HandlerOutcome::Stop
        }
        ExitReason::Hypercall => {
            handle_hypercall(&mut vm.vcpus[vcpu_index]);
            advance(&mut vm.vcpus[vcpu_index], exit);
            HandlerOutcome::Continue
        }
        ExitReason::ExternalInterrupt => HandlerOutcome::Continue,
        ExitReason::TripleFault => {
            log_error!("vm {}: guest triple fault", vm.id);
            HandlerOutcome::Stop
        }
        ExitReason::Unknown(raw) => {
            log_error!("vm {}: unhandled exit reason {}", vm.id, raw);
            HandlerOutcome::Stop
        }
    }
}

fn advance(vcpu: &mut Vcpu, exit: &ExitInfo) {
    vcpu.image.guest.rip = vcpu.image.guest.rip.wrapping_add(exit.instruction_len as u64);
}

/// Real CPUID with the virtualization-present and hypervisor-present bits
/// masked out, plus the identification leaf.
fn handle_cpuid(vcpu: &mut Vcpu) {
    let leaf = vcpu.gprs.rax as u32;
    let subleaf = vcpu.gprs.rcx as u32;
    let (mut a, mut b, mut c, mut d) = cpuid(leaf, subleaf);
    match leaf {
        1 => {
            c &= !(CPUID_ECX_VMX | CPUID_ECX_HYPERVISOR);
        }
        CPUID_HV_LEAF => {
            a = CPUID_HV_LEAF;
            b = u32::from_le_bytes([HYPERVISOR_SIGNATURE[0], HYPERVISOR_SIGNATURE[1], HYPERVISOR_SIGNATURE[2], HYPERVISOR_SIGNATURE[3]]);
            c = u32::from_le_bytes([HYPERVISOR_SIGNATURE[4], HYPERVISOR_SIGNATURE[5], HYPERVISOR_SIGNATURE[6], HYPERVISOR_SIGNATURE[7]]);
            d = u32::from_le_bytes([HYPERVISOR_SIGNATURE[8], HYPERVISOR_SIGNATURE[9], HYPERVISOR_SIGNATURE[10], HYPERVISOR_SIGNATURE[11]]);
        }
        _ => {}
    }
    vcpu.gprs.rax = a as u64;
    vcpu.gprs.rbx = b as u64;
    vcpu.gprs.rcx = c as u64;
    vcpu.gprs.rdx = d as u64;
}

/// IN from the bus (all-ones for unclaimed ports), OUT to the bus
/// (dropped for unclaimed ports). String operations are not emulated.
fn handle_io(vm: &mut Vm, vcpu_index: usize, io: IoExit) {
    if io.string_op || io.rep {
        log_warn!("vm {}: string I/O at port {:#x} ignored", vm.id, io.port);
        return;
    }
    if io.is_in {
        let value = vm.bus.read(io.port, io.width).unwrap_or(match io.width {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        });
        let rax = vm.vcpus[vcpu_index].gprs.rax;
        vm.vcpus[vcpu_index].gprs.rax = match io.width {
            1 => (rax & !0xFF) | (value as u64 & 0xFF),
            2 => (rax & !0xFFFF) | (value as u64 & 0xFFFF),
            // 32-bit results zero-extend
            _ => value as u64,
        };
    } else {
        let rax = vm.vcpus[vcpu_index].gprs.rax;
        let value = match io.width {
            1 => rax & 0xFF,
            2 => rax & 0xFFFF,
            _ => rax & 0xFFFF_FFFF,
        } as u32;
        if let Some(Some(vector)) = vm.bus.write(io.port, value, io.width, &vm.ram) {
            // Device completed work; signal the guest.
            vm.vcpus[0].queue_interrupt(vector);
        }
    }
}

fn handle_rdmsr(vcpu: &mut Vcpu) {
    let msr = vcpu.gprs.rcx as u32;
    let value = match msr {
        MSR_EFER => vcpu.image.guest.efer,
        MSR_APIC_BASE => {
            // Fixed xAPIC base, enabled; VCPU 0 is the bootstrap CPU.
            let mut v = 0xFEE0_0800u64;
            if vcpu.id == 0 {
                v |= 1 << 8;
            }
            v
        }
        MSR_FS_BASE => vcpu.image.guest.fs.base,
        MSR_GS_BASE => vcpu.image.guest.gs.base,
        _ => 0,
    };
    vcpu.gprs.rax = value & 0xFFFF_FFFF;
    vcpu.gprs.rdx = value >> 32;
}

fn handle_wrmsr(vcpu: &mut Vcpu) {
    let msr = vcpu.gprs.rcx as u32;
    let value = (vcpu.gprs.rdx << 32) | (vcpu.gprs.rax & 0xFFFF_FFFF);
    match msr {
        MSR_EFER => vcpu.image.guest.efer = value,
        MSR_FS_BASE => vcpu.image.guest.fs.base = value,
        MSR_GS_BASE => vcpu.image.guest.gs.base = value,
        _ => {
            log_warn!("vcpu {}: ignored write of {:#x} to MSR {:#x}", vcpu.id, value, msr);
        }
    }
}

fn handle_cr(vcpu: &mut Vcpu, cr: CrExit) -> HandlerOutcome {
    match cr.kind {
        CrAccessKind::MovToCr => {
            let value = read_gpr(vcpu, cr.gpr);
            match cr.cr {
                0 => {
                    vcpu.image.guest.cr0 = value;
                    vcpu.image.controls.cr0_shadow = value;
                }
                3 => vcpu.image.guest.cr3 = value,
                4 => {
                    vcpu.image.guest.cr4 = value;
                    vcpu.image.controls.cr4_shadow = value;
                }
                other => {
                    log_error!("vcpu {}: unsupported MOV to CR{}", vcpu.id, other);
                    return HandlerOutcome::Stop;
                }
            }
            HandlerOutcome::Continue
        }
        CrAccessKind::MovFromCr => {
            let value = match cr.cr {
                0 => vcpu.image.guest.cr0,
                3 => vcpu.image.guest.cr3,
                4 => vcpu.image.guest.cr4,
                other => {
                    log_error!("vcpu {}: unsupported MOV from CR{}", vcpu.id, other);
                    return HandlerOutcome::Stop;
                }
            };
            write_gpr(vcpu, cr.gpr, value);
            HandlerOutcome::Continue
        }
        CrAccessKind::Clts | CrAccessKind::Lmsw => {
            log_error!("vcpu {}: unsupported CR operation {:?}", vcpu.id, cr.kind);
            HandlerOutcome::Stop
        }
    }
}

/// The guest's A register selects a hypercall; the result returns in A.
fn handle_hypercall(vcpu: &mut Vcpu) {
    let index = vcpu.gprs.rax;
    vcpu.gprs.rax = match index {
        HC_PROBE => HC_PROBE_MAGIC,
        HC_VERSION => 0x0001_0000, // 1.0
        HC_LOG_BYTE => {
            let byte = (vcpu.gprs.rbx & 0xFF) as u8;
            log!("guest vcpu {}: {}", vcpu.id, byte as char);
            0
        }
        other => {
            log_warn!("vcpu {}: unknown hypercall {}", vcpu.id, other);
            u64::MAX
        }
    };
}

fn read_gpr(vcpu: &Vcpu, index: u8) -> u64 {
    let g = &vcpu.gprs;
    match index {
        0 => g.rax,
        1 => g.rcx,
        2 => g.rdx,
        3 => g.rbx,
        4 => vcpu.image.guest.rsp,
        5 => g.rbp,
        6 => g.rsi,
        7 => g.rdi,
        8 => g.r8,
        9 => g.r9,
        10 => g.r10,
        11 => g.r11,
        12 => g.r12,
        13 => g.r13,
        14 => g.r14,
        _ => g.r15,
    }
}

fn write_gpr(vcpu: &mut Vcpu, index: u8, value: u64) {
    match index {
        0 => vcpu.gprs.rax = value,
        1 => vcpu.gprs.rcx = value,
        2 => vcpu.gprs.rdx = value,
        3 => vcpu.gprs.rbx = value,
        4 => vcpu.image.guest.rsp = value,
        5 => vcpu.gprs.rbp = value,
        6 => vcpu.gprs.rsi = value,
        7 => vcpu.gprs.rdi = value,
        8 => vcpu.gprs.r8 = value,
        9 => vcpu.gprs.r9 = value,
        10 => vcpu.gprs.r10 = value,
        11 => vcpu.gprs.r11 = value,
        12 => vcpu.gprs.r12 = value,
        13 => vcpu.gprs.r13 = value,
        14 => vcpu.gprs.r14 = value,
        _ => vcpu.gprs.r15 = value,
    }
}
