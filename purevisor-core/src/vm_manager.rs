//! VM lifecycle management and the entry/exit loop
//!
//! The manager owns every VM, keyed by id, and drives VCPUs through a
//! [`VcpuRunner`]: the hardware runner performs the actual VMLAUNCH /
//! VMRESUME round trip, while tests substitute a scripted one. One core
//! drives one VCPU at a time; between entry and exit the core belongs to
//! the guest, everything here runs outside that window.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;

use purevisor_hal::arch::x86_64::vmx::VmxCapabilities;
use purevisor_hal::arch::x86_64::HostState;
use purevisor_hal::interrupts::InterruptInjector;
use purevisor_hal::memory::{FrameAllocator, HostMap};
use purevisor_hal::time::Clock;

use crate::dispatch::{dispatch, ExitInfo, HandlerOutcome};
use crate::uuid::{Rng64, Uuid};
use crate::vcb;
use crate::vcpu::{VcpuPhase, VmId};
use crate::vm::{Vm, VmError, VmPhase};

/// Drives one VCPU into the guest and back.
pub trait VcpuRunner {
    /// Prepare a VM for its first start: populate every VCPU's control
    /// block. The default implementation uses permissive synthetic
    /// capabilities; the hardware runner overrides with the real MSR
    /// snapshot and captured host state.
    fn prepare(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let caps = VmxCapabilities::synthetic();
        let host = HostState::default();
        let pointer = vm.gpt.pointer();
        for vcpu in &mut vm.vcpus {
            vcb::populate(vcpu, &caps, &host, pointer).map_err(|_| VmError::GuestFault)?;
        }
        Ok(())
    }

    /// Enter the guest until its next exit and return the decoded exit.
    fn run(&mut self, vm: &mut Vm, vcpu_index: usize) -> Result<ExitInfo, VmError>;
}

/// VM registry and lifecycle driver.
pub struct VmManager<R: VcpuRunner> {
    vms: BTreeMap<VmId, Vm>,
    runner: R,
    alloc: Box<dyn FrameAllocator + Send>,
    map: HostMap,
    clock: Box<dyn Clock + Send>,
    next_id: VmId,
    rng: Rng64,
}

impl<R: VcpuRunner> VmManager<R> {
    pub fn new(
        runner: R,
        alloc: Box<dyn FrameAllocator + Send>,
        map: HostMap,
        clock: Box<dyn Clock + Send>,
        seed: u64,
    ) -> Self {
        VmManager {
            vms: BTreeMap::new(),
            runner,
            alloc,
            map,
            clock,
            next_id: 1,
            rng: Rng64::new(seed),
        }
    }

    /// Create a VM with its arena and translation tables plus `vcpus`
    /// virtual CPUs.
    pub fn create(&mut self, name: &str, memory_size: usize, vcpus: u32) -> Result<VmId, VmError> {
        let id = self.next_id;
        self.next_id += 1;
        let uuid = Uuid::new_v4(&mut self.rng);
        let mut vm = Vm::new(id, String::from(name), uuid, memory_size, self.alloc.as_mut(), self.map)?;
        for _ in 0..vcpus {
            if let Err(err) = vm.add_vcpu(self.alloc.as_mut()) {
                vm.destroy(self.alloc.as_mut());
                return Err(err);
            }
        }
        log!("vm {} \"{}\" created ({} MiB, {} vcpus)", id, name, memory_size / (1 << 20), vcpus);
        self.vms.insert(id, vm);
        Ok(id)
    }

    pub fn find(&self, name: &str) -> Option<VmId> {
        self.vms.values().find(|vm| vm.name == name).map(|vm| vm.id)
    }

    pub fn vm(&self, id: VmId) -> Option<&Vm> {
        self.vms.get(&id)
    }

    pub fn vm_mut(&mut self, id: VmId) -> Option<&mut Vm> {
        self.vms.get_mut(&id)
    }

    pub fn vm_ids(&self) -> impl Iterator<Item = VmId> + '_ {
        self.vms.keys().copied()
    }

    /// Destroy a VM. Running VMs must be stopped first; Error is terminal
    /// but destroyable.
    pub fn destroy(&mut self, id: VmId) -> Result<(), VmError> {
        let vm = self.vms.get(&id).ok_or(VmError::NotFound)?;
        match vm.phase {
            VmPhase::Created | VmPhase::Stopped | VmPhase::Error => {}
            from => return Err(VmError::InvalidTransition { from, to: VmPhase::Stopped }),
        }
        if let Some(vm) = self.vms.remove(&id) {
            vm.destroy(self.alloc.as_mut());
        }
        Ok(())
    }

    /// Created/Stopped -> Starting -> Running, populating control blocks
    /// on the way.
    pub fn start(&mut self, id: VmId) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        vm.set_phase(VmPhase::Starting)?;
        if let Err(err) = self.runner.prepare(vm) {
            let _ = vm.set_phase(VmPhase::Error);
            return Err(err);
        }
        for vcpu in &mut vm.vcpus {
            vcpu.phase = VcpuPhase::Running;
            vcpu.launched = false;
        }
        vm.set_phase(VmPhase::Running)
    }

    /// Graceful stop: VCPUs halt at their next exit, no new entries occur.
    pub fn stop(&mut self, id: VmId) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        vm.set_phase(VmPhase::Stopping)?;
        for vcpu in &mut vm.vcpus {
            vcpu.phase = VcpuPhase::Shutdown;
        }
        vm.set_phase(VmPhase::Stopped)
    }

    /// Immediate stop, legal from any non-terminal phase.
    pub fn force_stop(&mut self, id: VmId) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        if vm.phase == VmPhase::Error {
            return Err(VmError::InvalidTransition { from: vm.phase, to: VmPhase::Stopped });
        }
        for vcpu in &mut vm.vcpus {
            vcpu.phase = VcpuPhase::Shutdown;
        }
        vm.phase = VmPhase::Stopped;
        Ok(())
    }

    pub fn pause(&mut self, id: VmId) -> Result<(), VmError> {
        self.vms.get_mut(&id).ok_or(VmError::NotFound)?.set_phase(VmPhase::Paused)
    }

    pub fn resume(&mut self, id: VmId) -> Result<(), VmError> {
        self.vms.get_mut(&id).ok_or(VmError::NotFound)?.set_phase(VmPhase::Running)
    }

    pub fn restart(&mut self, id: VmId) -> Result<(), VmError> {
        self.stop(id)?;
        self.start(id)
    }

    /// Record a migration intent. Convergence is out of scope; the state
    /// machine transition and target bookkeeping are validated here.
    pub fn migrate(&mut self, id: VmId, target_node: u32) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        vm.set_phase(VmPhase::Migrating)?;
        vm.migration_target = Some(target_node);
        Ok(())
    }

    /// Finish (or abort) a migration locally.
    pub fn complete_migration(&mut self, id: VmId, keep_running: bool) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        let to = if keep_running { VmPhase::Running } else { VmPhase::Stopped };
        vm.set_phase(to)?;
        vm.migration_target = None;
        Ok(())
    }

    /// Entry loop for one VCPU. Runs until the VCPU halts with nothing
    /// pending, the VM leaves Running, or a fatal exit marks the VM Error.
    pub fn run_vcpu(&mut self, id: VmId, vcpu_index: usize) -> Result<(), VmError> {
        loop {
            let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
            if vm.phase != VmPhase::Running {
                return Ok(());
            }
            let vcpu = vm.vcpus.get_mut(vcpu_index).ok_or(VmError::NotFound)?;
            match vcpu.phase {
                VcpuPhase::Shutdown => return Ok(()),
                VcpuPhase::Halted | VcpuPhase::Waiting => {
                    // HLT semantics: resume only once an interrupt is
                    // pending for the guest.
                    if vcpu.has_pending_interrupt() {
                        vcpu.phase = VcpuPhase::Running;
                    } else {
                        return Ok(());
                    }
                }
                VcpuPhase::Created | VcpuPhase::Running => {}
            }
            let entered = self.clock.cycles();
            let exit = match self.runner.run(vm, vcpu_index) {
                Ok(exit) => exit,
                Err(err) => {
                    log_error!("vm {}: entry failed on vcpu {}: {:?}", id, vcpu_index, err);
                    let _ = vm.set_phase(VmPhase::Error);
                    return Err(err);
                }
            };
            let latency = self.clock.cycles().wrapping_sub(entered);
            vm.stats.record_exit(exit.raw_reason as usize & 0x3F, latency);
            match dispatch(vm, vcpu_index, &exit) {
                HandlerOutcome::Continue => {}
                HandlerOutcome::Stop => {
                    log_error!("vm {}: fatal exit {:?}", id, exit.reason);
                    let _ = vm.set_phase(VmPhase::Error);
                    for vcpu in &mut vm.vcpus {
                        vcpu.phase = VcpuPhase::Shutdown;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Queue an external interrupt for a VCPU (device back-end path).
    pub fn inject(&mut self, id: VmId, vcpu_index: usize, vector: u8) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        let vcpu = vm.vcpus.get_mut(vcpu_index).ok_or(VmError::NotFound)?;
        vcpu.queue_interrupt(vector);
        Ok(())
    }

    /// Drain device-initiated work for every device of a VM (inbound
    /// network frames and the like) and signal the guest through the
    /// plumbing's interrupt injector.
    pub fn flush_device_work(&mut self, id: VmId, injector: &dyn InterruptInjector) -> Result<(), VmError> {
        let vm = self.vms.get_mut(&id).ok_or(VmError::NotFound)?;
        if vm.phase != VmPhase::Running {
            return Ok(());
        }
        for index in 0..vm.bus.device_count() {
            let Some(device) = vm.bus.device_mut(index) else {
                continue;
            };
            let vector = device.irq_vector();
            match device.poll(&vm.ram) {
                Ok(true) => {
                    injector.inject(0, vector);
                    if let Some(vcpu) = vm.vcpus.first_mut() {
                        vcpu.queue_interrupt(vector);
                    }
                }
                Ok(false) => {}
                Err(err) => log_warn!("vm {}: device {} poll failed {:?}", id, index, err),
            }
        }
        Ok(())
    }
}
