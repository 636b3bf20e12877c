//! Dispatch of EPT violations to handlers registered for guest-physical ranges.
//!
//! Handlers are kept in registration order and searched newest first, so a handler added for a
//! range overlapping an older one takes precedence over it. Handlers are never removed.

use {
    crate::{
        error::HypervisorError,
        intel::{ept::EptConfig, vmerror::EptViolationExitQualification, vmexit::GuestState},
        utils::{addresses::PhysicalAddress, debug::dbg_break},
    },
    core::ops::RangeInclusive,
};

/// Callback invoked for a violation inside the handler's range.
///
/// Receives the EPT so that it can split pages and change permissions, the exit information of
/// the violation, and the parameter given at registration. Returns whether the violation was
/// handled. Runs in VMX root on the faulting processor and must not block.
pub type ViolationCallback =
    fn(ept: &mut EptConfig, guest: &dyn GuestState, user_parameter: usize) -> bool;

/// A registered handler.
#[derive(Clone)]
pub struct ViolationHandler {
    /// Guest-physical addresses the handler is responsible for (inclusive).
    pub range: RangeInclusive<u64>,
    callback: ViolationCallback,
    user_parameter: usize,
}

impl ViolationHandler {
    pub fn user_parameter(&self) -> usize {
        self.user_parameter
    }
}

/// Stable identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerHandle(usize);

impl EptConfig {
    /// Registers `callback` for violations on guest-physical addresses inside `range`.
    ///
    /// The new handler takes precedence over every handler registered before it. Overlap with
    /// existing handlers is allowed and not checked.
    ///
    /// # Errors
    /// - `InvalidParameter` if `callback` is `None` or the range is empty.
    /// - `NoMemory` if the handler record cannot be allocated.
    pub fn add_violation_handler(
        &mut self,
        range: RangeInclusive<u64>,
        callback: Option<ViolationCallback>,
        user_parameter: usize,
    ) -> Result<HandlerHandle, HypervisorError> {
        let callback = callback.ok_or(HypervisorError::InvalidParameter)?;

        if range.is_empty() {
            return Err(HypervisorError::InvalidParameter);
        }

        self.handlers
            .try_reserve(1)
            .map_err(|_| HypervisorError::NoMemory)?;

        log::info!(
            "Registered EPT violation handler for {:#x}..={:#x}",
            range.start(),
            range.end()
        );

        let handle = HandlerHandle(self.handlers.len());
        self.handlers.push(ViolationHandler {
            range,
            callback,
            user_parameter,
        });

        Ok(handle)
    }

    /// Returns the handler registered under `handle`.
    pub fn violation_handler(&self, handle: HandlerHandle) -> Option<&ViolationHandler> {
        self.handlers.get(handle.0)
    }

    /// Dispatches the EPT violation described by `guest` to the newest handler whose range
    /// contains the faulting guest-physical address.
    ///
    /// # Returns
    /// The handler's result, or `false` if no handler covers the address. Whenever the result is
    /// `false` the violation is logged in full and the debugger is broken into before returning.
    pub fn handle_violation(&mut self, guest: &dyn GuestState) -> bool {
        let guest_pa = guest.guest_physical_address();

        let handler = self
            .handlers
            .iter()
            .rev()
            .find(|handler| handler.range.contains(&guest_pa))
            .map(|handler| (handler.callback, handler.user_parameter));

        let handled = match handler {
            Some((callback, user_parameter)) => callback(self, guest, user_parameter),
            None => false,
        };

        if !handled {
            self.report_unhandled(guest_pa, guest, handler.is_some());
            dbg_break();
        }

        handled
    }

    /// Number of violations reported as unhandled since the EPT was created.
    pub fn unhandled_violations(&self) -> usize {
        self.unhandled_violations
    }

    /// Logs everything known about a violation that was not handled.
    fn report_unhandled(&mut self, guest_pa: u64, guest: &dyn GuestState, declined: bool) {
        self.unhandled_violations += 1;

        let qualification =
            EptViolationExitQualification::from_exit_qualification(guest.exit_qualification());

        if declined {
            log::error!("Unhandled EPT violation, the registered handler declined it");
        } else {
            log::error!("Unhandled EPT violation, no handler covers the address");
        }
        log::error!("Faulting guest physical address: {:#x}", guest_pa);
        log::error!(
            "Faulting guest page: {:#x}",
            PhysicalAddress::from_pa(guest_pa).page_aligned()
        );
        if qualification.valid_guest_linear_address() {
            log::error!("Faulting guest linear address: {:#x}", guest.guest_linear_address());
        }
        log::error!("Guest RIP: {:#x}", guest.guest_rip());

        log::error!("Exit qualification: {:#x} ({})", qualification.raw(), qualification);
        log::error!("  read access: {}", qualification.read_access());
        log::error!("  write access: {}", qualification.write_access());
        log::error!("  execute access: {}", qualification.execute_access());
        log::error!("  EPT readable: {}", qualification.ept_readable());
        log::error!("  EPT writable: {}", qualification.ept_writable());
        log::error!("  EPT executable: {}", qualification.ept_executable());
        log::error!("  EPT user executable: {}", qualification.ept_user_executable());
        log::error!("  valid guest linear address: {}", qualification.valid_guest_linear_address());
        log::error!("  caused by translation: {}", qualification.caused_by_translation());
        log::error!("  user mode linear address: {}", qualification.user_mode_linear_address());
        log::error!("  readable/writable page: {}", qualification.readable_writable_page());
        log::error!("  execute disable page: {}", qualification.execute_disable_page());
        log::error!("  NMI unblocking: {}", qualification.nmi_unblocking());
        log::error!("  shadow stack access: {}", qualification.shadow_stack_access());
        log::error!("  supervisor shadow stack: {}", qualification.supervisor_shadow_stack());
        log::error!("  guest paging verification: {}", qualification.guest_paging_verification());
        log::error!("  asynchronous to instruction: {}", qualification.asynchronous_to_instruction());

        self.dump_entries(guest_pa);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::ept::{access::AccessType, tests::initialized},
            utils::addresses::IdentityMapped,
        },
    };

    struct Exit {
        guest_pa: u64,
        qualification: u64,
    }

    impl Exit {
        fn at(guest_pa: u64) -> Self {
            Self {
                guest_pa,
                qualification: 0x1aa,
            }
        }
    }

    impl GuestState for Exit {
        fn guest_physical_address(&self) -> u64 {
            self.guest_pa
        }

        fn exit_qualification(&self) -> u64 {
            self.qualification
        }

        fn guest_linear_address(&self) -> u64 {
            0xffff_f800_1234_5000
        }

        fn guest_rip(&self) -> u64 {
            0xffff_f800_0040_1000
        }
    }

    // Reports which handler ran by mapping its parameter to a permission on page 0.
    fn record(ept: &mut EptConfig, _guest: &dyn GuestState, user_parameter: usize) -> bool {
        let access = match user_parameter {
            1 => AccessType::READ,
            2 => AccessType::READ_WRITE,
            _ => AccessType::EXECUTE,
        };
        ept.set_permissions(0, access).is_ok()
    }

    fn decline(_ept: &mut EptConfig, _guest: &dyn GuestState, _user_parameter: usize) -> bool {
        false
    }

    fn unlock_page(ept: &mut EptConfig, guest: &dyn GuestState, _user_parameter: usize) -> bool {
        let page = guest.guest_physical_address();

        match ept.split_large_page(page, &IdentityMapped) {
            Ok(()) | Err(HypervisorError::AlreadyComplete) => {}
            Err(_) => return false,
        }

        ept.set_permissions(page, AccessType::READ_WRITE_EXECUTE).is_ok()
    }

    fn access_of_page_zero(ept: &EptConfig) -> AccessType {
        AccessType::of(ept.upper_leaf_from_address(0).unwrap())
    }

    #[test]
    fn rejects_missing_callback() {
        let mut ept = initialized(&[]);

        assert_eq!(
            ept.add_violation_handler(0..=0xfff, None, 0),
            Err(HypervisorError::InvalidParameter)
        );
        assert!(!ept.handle_violation(&Exit::at(0x10)));
        assert_eq!(ept.unhandled_violations(), 1);
    }

    #[test]
    fn dispatches_disjoint_ranges() {
        let mut ept = initialized(&[]);
        ept.add_violation_handler(0x1000..=0x1fff, Some(record), 1).unwrap();
        ept.add_violation_handler(0x3000..=0x3fff, Some(record), 2).unwrap();

        assert!(ept.handle_violation(&Exit::at(0x1fff)));
        assert_eq!(access_of_page_zero(&ept), AccessType::READ);

        assert!(ept.handle_violation(&Exit::at(0x3000)));
        assert_eq!(access_of_page_zero(&ept), AccessType::READ_WRITE);

        assert!(!ept.handle_violation(&Exit::at(0x2000)));
        assert_eq!(access_of_page_zero(&ept), AccessType::READ_WRITE);
        assert_eq!(ept.unhandled_violations(), 1);
    }

    #[test]
    fn newest_overlapping_handler_wins() {
        let mut ept = initialized(&[]);
        let older = ept.add_violation_handler(0..=0xffff, Some(record), 1).unwrap();
        let newer = ept.add_violation_handler(0x4000..=0x4fff, Some(record), 2).unwrap();

        assert_ne!(older, newer);
        assert_eq!(ept.violation_handler(newer).unwrap().user_parameter(), 2);

        assert!(ept.handle_violation(&Exit::at(0x4800)));
        assert_eq!(access_of_page_zero(&ept), AccessType::READ_WRITE);

        assert!(ept.handle_violation(&Exit::at(0x5000)));
        assert_eq!(access_of_page_zero(&ept), AccessType::READ);
    }

    #[test]
    fn declined_violation_is_reported_as_unhandled() {
        let mut ept = initialized(&[]);
        ept.add_violation_handler(0..=u64::MAX, Some(decline), 0).unwrap();

        assert!(!ept.handle_violation(&Exit::at(0x1234)));
        assert_eq!(ept.unhandled_violations(), 1);

        // A handler that resolves the access is not reported.
        ept.add_violation_handler(0x1000..=0x1fff, Some(record), 1).unwrap();
        assert!(ept.handle_violation(&Exit::at(0x1234)));
        assert_eq!(ept.unhandled_violations(), 1);

        assert!(!ept.handle_violation(&Exit::at(0x2000)));
        assert_eq!(ept.unhandled_violations(), 2);
    }

    #[test]
    fn handler_can_split_and_edit_the_ept() {
        let mut ept = initialized(&[]);
        ept.split_large_page(0x80_0000, &IdentityMapped).unwrap();
        ept.set_permissions(0x80_5000, AccessType::empty()).unwrap();
        ept.add_violation_handler(0x80_0000..=0x9f_ffff, Some(unlock_page), 0).unwrap();

        assert!(ept.handle_violation(&Exit::at(0x80_5000)));
        let pte = ept.lowest_entry_from_address(0x80_5000).unwrap();
        assert_eq!(AccessType::of(pte), AccessType::READ_WRITE_EXECUTE);
    }

    #[test]
    fn empty_range_is_rejected() {
        let mut ept = initialized(&[]);

        #[allow(clippy::reversed_empty_ranges)]
        let range = 0x2000..=0x1000;
        assert_eq!(
            ept.add_violation_handler(range, Some(decline), 0),
            Err(HypervisorError::InvalidParameter)
        );
    }
}
