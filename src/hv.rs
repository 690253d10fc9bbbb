//! Bare-metal VCPU runner
//!
//! Binds the core's entry loop to the hardware: flushes the control-block
//! mirror into the VMCS region, performs the launch/resume round trip
//! through the entry stub, and decodes the exit fields back into the
//! mirror. Everything in this module requires ring 0 in VMX root
//! operation; hosted tests drive the core with a scripted runner instead.

#![cfg(target_arch = "x86_64")]

use alloc::collections::BTreeMap;

use purevisor_core::dispatch::ExitInfo;
use purevisor_core::vm::{Vm, VmError};
use purevisor_core::vm_manager::VcpuRunner;
use purevisor_core::{vcb, vcpu::VmId};
use purevisor_hal::arch::x86_64::vmx::{self, VmxCapabilities};
use purevisor_hal::arch::x86_64::{HostState, Vmcs};
use purevisor_hal::memory::HostMap;

/// Hardware-backed implementation of the core's runner contract.
pub struct HwVcpuRunner {
    caps: VmxCapabilities,
    map: HostMap,
    /// GPT generation last invalidated per VM, so permission-reducing
    /// mutations reach the hardware before the next entry.
    flushed: BTreeMap<VmId, u64>,
}

impl HwVcpuRunner {
    /// # Safety
    /// Requires ring 0 on a VMX-capable processor; reads capability MSRs.
    pub unsafe fn new(map: HostMap) -> Self {
        // SAFETY: forwarded to the caller.
        let caps = unsafe { VmxCapabilities::read() };
        HwVcpuRunner { caps, map, flushed: BTreeMap::new() }
    }

    /// Bring this core into VMX root operation and hand back the runner.
    /// Called once per core with that core's reserved VMXON frame.
    ///
    /// # Safety
    /// Ring 0; `vmxon_frame` must be a free 4 KiB frame owned by this CPU.
    pub unsafe fn enable_this_cpu(
        map: HostMap,
        vmxon_frame: purevisor_hal::memory::PhysicalAddress,
    ) -> Result<Self, VmError> {
        // SAFETY: forwarded to the caller.
        let runner = unsafe { Self::new(map) };
        // SAFETY: as above.
        unsafe { vmx::enable_current_cpu(&runner.caps, vmxon_frame, map) }
            .map_err(|_| VmError::GuestFault)?;
        Ok(runner)
    }
}

impl VcpuRunner for HwVcpuRunner {
    fn prepare(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let pointer = vm.gpt.pointer();
        for vcpu in &mut vm.vcpus {
            // SAFETY: ring 0 per the constructor contract.
            let host = unsafe { HostState::capture(vmx::exit_stub_address(), vcpu.stack_top()) };
            vcb::populate(vcpu, &self.caps, &host, pointer).map_err(|_| VmError::GuestFault)?;
        }
        Ok(())
    }

    fn run(&mut self, vm: &mut Vm, vcpu_index: usize) -> Result<ExitInfo, VmError> {
        let gpt_generation = vm.gpt.generation();
        let gpt_pointer = vm.gpt.pointer();
        let vm_id = vm.id;
        let vcpu = vm.vcpus.get_mut(vcpu_index).ok_or(VmError::NotFound)?;

        let vmcs = Vmcs::new(vcpu.vmcs_frame);
        if !vcpu.launched {
            // The revision identifier is the first word of the region.
            let revision_ptr = self.map.ptr_of(vcpu.vmcs_frame) as *mut u32;
            // SAFETY: the frame is owned by this VCPU and identity mapped.
            unsafe { core::ptr::write_volatile(revision_ptr, vcpu.image.revision_id) };
            vmcs.clear().map_err(|_| VmError::GuestFault)?;
        }
        let mut active = vmcs.load().map_err(|_| VmError::GuestFault)?;
        if !vcpu.launched {
            vcpu.image.flush(&mut active).map_err(|_| VmError::GuestFault)?;
        } else {
            vcpu.image.flush_guest_dynamic(&mut active).map_err(|_| VmError::GuestFault)?;
        }

        if self.flushed.get(&vm_id).copied().unwrap_or(0) != gpt_generation {
            // SAFETY: VMX root operation with EPT enabled.
            unsafe { vmx::invept_single(gpt_pointer) }.map_err(|_| VmError::GuestFault)?;
            self.flushed.insert(vm_id, gpt_generation);
        }

        if let Some(vector) = vcpu.take_pending_interrupt() {
            // Valid external-interrupt injection for the coming entry.
            let info = 0x8000_0000u64 | vector as u64;
            active
                .write(purevisor_hal::arch::x86_64::VmcsField::VM_ENTRY_INTR_INFO, info)
                .map_err(|_| VmError::GuestFault)?;
        }

        let launched = vcpu.launched;
        // SAFETY: the VMCS is current, fully populated, and gprs is this
        // guest's register file.
        unsafe { vmx::enter_guest(&mut vcpu.gprs, launched) }.map_err(|_| VmError::GuestFault)?;
        vcpu.launched = true;

        vcpu.image.capture_exit(&active).map_err(|_| VmError::GuestFault)?;
        let exit = &vcpu.image.exit;
        Ok(ExitInfo::from_raw(exit.reason, exit.qualification, exit.guest_physical, exit.instruction_len))
    }
}
