use {
    crate::intel::{
        ept::EptConfig,
        support::vmread,
        vmexit::{ExitType, GuestState, VmcsGuestState},
    },
    x86::vmx::vmcs,
};

/// Handle VM exits for EPT violations. Violations are thrown whenever an operation is performed on an EPT entry that does not provide permissions to access that page.
///
/// Reference: 29.3.3.2 EPT Violations
pub fn handle_ept_violation(ept: &mut EptConfig) -> ExitType {
    exit_for_violation(ept, &VmcsGuestState)
}

/// Dispatches the violation described by `guest` and decides how the exit ends.
///
/// A handled violation resumes the guest without advancing RIP, so the faulting instruction runs
/// again against the updated EPT. An unhandled one has already been reported and broken into the
/// debugger; the guest is never resumed, since it would fault on the same access forever.
pub fn exit_for_violation(ept: &mut EptConfig, guest: &dyn GuestState) -> ExitType {
    if !ept.handle_violation(guest) {
        log::error!(
            "Unhandled EPT violation at {:#x}, not resuming the guest",
            guest.guest_physical_address()
        );
        return ExitType::ExitHypervisor;
    }

    ExitType::Continue
}

/// Handles an EPT misconfiguration VM exit.
///
/// A misconfiguration means the tables built here are malformed, which is not recoverable.
///
/// Reference: 29.3.3.1 EPT Misconfigurations
pub fn handle_ept_misconfiguration(ept: &EptConfig) -> ExitType {
    let guest_physical_address = vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);

    log::error!("EPT Misconfiguration: Faulting guest address: {:#x}", guest_physical_address);
    ept.dump_entries(guest_physical_address);

    crate::utils::debug::dbg_break();

    ExitType::ExitHypervisor
}
