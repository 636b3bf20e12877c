//! VM-exit information consumed by the EPT violation dispatcher.
//!
//! The dispatcher reads the guest state through [`GuestState`] so that it does not depend on a
//! current VMCS. [`VmcsGuestState`] is the implementation used while handling a real VM exit.

use {
    crate::intel::support::vmread,
    x86::vmx::vmcs::{guest, ro},
};

pub mod ept;

/// What the exit handler wants the VM-exit loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Resume the guest.
    Continue,
    /// Leave the guest and stop virtualizing the processor.
    ExitHypervisor,
}

/// The VM-exit information fields an EPT violation handler can inspect.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9 VM-EXIT INFORMATION FIELDS
pub trait GuestState {
    /// The guest-physical address whose access caused the violation.
    fn guest_physical_address(&self) -> u64;

    /// The raw exit qualification, see `EptViolationExitQualification`.
    fn exit_qualification(&self) -> u64;

    /// The guest linear address, meaningful only if the qualification says it is valid.
    fn guest_linear_address(&self) -> u64;

    /// The guest instruction pointer at the time of the exit.
    fn guest_rip(&self) -> u64;
}

/// Reads the exit information from the current VMCS.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmcsGuestState;

impl GuestState for VmcsGuestState {
    fn guest_physical_address(&self) -> u64 {
        vmread(ro::GUEST_PHYSICAL_ADDR_FULL)
    }

    fn exit_qualification(&self) -> u64 {
        vmread(ro::EXIT_QUALIFICATION)
    }

    fn guest_linear_address(&self) -> u64 {
        vmread(ro::GUEST_LINEAR_ADDR)
    }

    fn guest_rip(&self) -> u64 {
        vmread(guest::RIP)
    }
}
