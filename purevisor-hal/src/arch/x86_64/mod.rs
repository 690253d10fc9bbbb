//! Intel x86_64 virtualization primitives

pub mod vmcs;
pub mod vmx;

pub use vmcs::{ActiveVmcs, Controls, ExitFields, GuestState, HostState, Segment, TableRegister, Vmcs, VmcsField, VmcsImage};
pub use vmx::{ControlError, CtrlCaps, VmxCapabilities, VmxError};
