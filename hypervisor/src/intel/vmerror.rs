//! Decoding of the exit qualification saved by the processor on an EPT violation.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations

use bitfield::bitfield;

bitfield! {
    /// Exit qualification of an EPT violation.
    ///
    /// Bits 0-2 describe the attempted access, bits 3-6 the rights the EPT granted for the
    /// guest-physical address, bits 7-8 whether a guest linear address is available and what
    /// kind of access produced it.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptViolationExitQualification(u64);
    impl Debug;

    pub read_access, _: 0;
    pub write_access, _: 1;
    pub execute_access, _: 2;
    pub ept_readable, _: 3;
    pub ept_writable, _: 4;
    pub ept_executable, _: 5;
    pub ept_user_executable, _: 6;
    pub valid_guest_linear_address, _: 7;
    pub caused_by_translation, _: 8;
    pub user_mode_linear_address, _: 9;
    pub readable_writable_page, _: 10;
    pub execute_disable_page, _: 11;
    pub nmi_unblocking, _: 12;
    pub shadow_stack_access, _: 13;
    pub supervisor_shadow_stack, _: 14;
    pub guest_paging_verification, _: 15;
    pub asynchronous_to_instruction, _: 16;
}

impl EptViolationExitQualification {
    pub const fn from_exit_qualification(value: u64) -> Self {
        Self(value)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for EptViolationExitQualification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let access = |allowed: bool, flag: char| if allowed { flag } else { '-' };

        write!(
            f,
            "access {}{}{} ept {}{}{}{}",
            access(self.read_access(), 'R'),
            access(self.write_access(), 'W'),
            access(self.execute_access(), 'X'),
            access(self.ept_readable(), 'R'),
            access(self.ept_writable(), 'W'),
            access(self.ept_executable(), 'X'),
            access(self.ept_user_executable(), 'U'),
        )
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::format};

    #[test]
    fn decodes_write_to_read_only_page() {
        // Write attempt on a page the EPT maps read/execute, with a valid linear address.
        let qualification = EptViolationExitQualification::from_exit_qualification(0x1aa);

        assert!(!qualification.read_access());
        assert!(qualification.write_access());
        assert!(!qualification.execute_access());
        assert!(qualification.ept_readable());
        assert!(!qualification.ept_writable());
        assert!(qualification.ept_executable());
        assert!(qualification.valid_guest_linear_address());
        assert!(qualification.caused_by_translation());
        assert!(!qualification.nmi_unblocking());

        assert_eq!(format!("{}", qualification), "access -W- ept R-X-");
    }
}
