#[cfg(not(test))]
use x86_64::{instructions::tlb, VirtAddr};

/// Reads an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Invalidates the TLB entry for the page containing `va` (INVLPG).
///
/// Does nothing under `cfg(test)`, where page tables are simulated and INVLPG would fault.
pub fn invlpg(va: u64) {
    #[cfg(not(test))]
    tlb::flush(VirtAddr::new(va));

    #[cfg(test)]
    let _ = va;
}
