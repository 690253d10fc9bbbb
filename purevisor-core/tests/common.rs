//! Common test helpers and dummy implementations used across integration
//! tests.

extern crate std;

use std::boxed::Box;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use purevisor_core::cluster::{ClusterTransport, NodeId};
use purevisor_core::dispatch::ExitInfo;
use purevisor_core::vm::{Vm, VmError};
use purevisor_core::vm_manager::VcpuRunner;
use purevisor_hal::arch::x86_64::vmx::{
    EXIT_REASON_CPUID, EXIT_REASON_CR_ACCESS, EXIT_REASON_HLT, EXIT_REASON_IO_INSTRUCTION,
    EXIT_REASON_RDMSR, EXIT_REASON_TRIPLE_FAULT, EXIT_REASON_VMCALL, EXIT_REASON_WRMSR,
};

/// Runner that replays a canned exit stream instead of entering a guest.
/// Vectors it "injects" at entry are recorded for assertions.
pub struct ScriptedRunner {
    script: VecDeque<ExitInfo>,
    injected: Rc<RefCell<Vec<u8>>>,
}

impl ScriptedRunner {
    pub fn new(script: impl IntoIterator<Item = ExitInfo>) -> Self {
        ScriptedRunner { script: script.into_iter().collect(), injected: Rc::default() }
    }

    /// Shared view of the vectors delivered to the guest so far.
    pub fn injections(&self) -> Rc<RefCell<Vec<u8>>> {
        self.injected.clone()
    }
}

impl VcpuRunner for ScriptedRunner {
    fn run(&mut self, vm: &mut Vm, vcpu_index: usize) -> Result<ExitInfo, VmError> {
        let vcpu = vm.vcpus.get_mut(vcpu_index).ok_or(VmError::NotFound)?;
        vcpu.launched = true;
        // Entry consumes a queued interrupt, like the injection field
        // write on the hardware path.
        if let Some(vector) = vcpu.take_pending_interrupt() {
            self.injected.borrow_mut().push(vector);
        }
        // An exhausted script behaves like a guest that halts.
        Ok(self.script.pop_front().unwrap_or_else(exit_hlt))
    }
}

pub fn exit_cpuid() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_CPUID, 0, 0, 2)
}

pub fn exit_hlt() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_HLT, 0, 0, 1)
}

pub fn exit_rdmsr() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_RDMSR, 0, 0, 2)
}

pub fn exit_wrmsr() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_WRMSR, 0, 0, 2)
}

pub fn exit_hypercall() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_VMCALL, 0, 0, 3)
}

pub fn exit_triple_fault() -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_TRIPLE_FAULT, 0, 0, 0)
}

/// OUT to `port`, byte width.
pub fn exit_io_out8(port: u16) -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_IO_INSTRUCTION, (port as u64) << 16, 0, 2)
}

/// OUT to `port`, word width.
pub fn exit_io_out16(port: u16) -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_IO_INSTRUCTION, ((port as u64) << 16) | 0x1, 0, 2)
}

/// OUT to `port`, dword width.
pub fn exit_io_out32(port: u16) -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_IO_INSTRUCTION, ((port as u64) << 16) | 0x3, 0, 2)
}

/// IN from `port`, dword width.
pub fn exit_io_in32(port: u16) -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_IO_INSTRUCTION, ((port as u64) << 16) | 0xB, 0, 2)
}

/// MOV to CR with the given control register and source GPR.
pub fn exit_mov_to_cr(cr: u8, gpr: u8) -> ExitInfo {
    ExitInfo::from_raw(EXIT_REASON_CR_ACCESS, ((gpr as u64) << 8) | cr as u64, 0, 3)
}

/// Shared delivery fabric for multi-node log tests: every send lands in
/// one mailbox queue tagged with its destination.
#[derive(Clone, Default)]
pub struct Mesh {
    mailbox: Rc<RefCell<VecDeque<(NodeId, Vec<u8>)>>>,
}

impl Mesh {
    pub fn new() -> Self {
        Mesh::default()
    }

    pub fn transport(&self) -> Box<MeshTransport> {
        Box::new(MeshTransport { mesh: self.clone() })
    }

    pub fn take(&self) -> Option<(NodeId, Vec<u8>)> {
        self.mailbox.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.borrow().is_empty()
    }
}

pub struct MeshTransport {
    mesh: Mesh,
}

impl ClusterTransport for MeshTransport {
    fn send(&mut self, peer: NodeId, bytes: &[u8]) {
        self.mesh.mailbox.borrow_mut().push_back((peer, bytes.to_vec()));
    }
}
