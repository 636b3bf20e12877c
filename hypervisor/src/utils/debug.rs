/// Breaks into an attached debugger.
///
/// Used when guest execution must not continue: an unhandled EPT violation leaves the guest
/// facing a fault nobody resolved. Under `cfg(test)` this only returns, so dispatch logic can be
/// exercised on the build host.
#[inline(always)]
pub fn dbg_break() {
    #[cfg(not(test))]
    unsafe {
        core::arch::asm!("int 3")
    };
}
