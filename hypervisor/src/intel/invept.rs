//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
//!
//! The INVEPT instruction invalidates entries in the translation lookaside buffer (TLB) and other processor structures
//! that cache translations derived from EPT. Every split or permission edit of a live EPT has to be followed by it.

use static_assertions::const_assert_eq;

/// Represents the types of INVEPT operations.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate guest-physical and combined mappings associated with the EPTP in the descriptor.
    SingleContext = 1,

    /// Invalidate guest-physical and combined mappings associated with all EPTPs.
    AllContexts = 2,
}

/// The 128-bit INVEPT descriptor.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Figure 31-1. INVEPT Descriptor
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InveptDescriptor {
    /// The EPTP to invalidate. Ignored for all-context invalidation.
    pub eptp: u64,
    /// Must be zero.
    reserved: u64,
}
const_assert_eq!(core::mem::size_of::<InveptDescriptor>(), 16);

impl InveptDescriptor {
    pub const fn new(eptp: u64) -> Self {
        Self { eptp, reserved: 0 }
    }
}

/// Executes the INVEPT instruction.
fn invept(invept_type: InveptType, descriptor: &InveptDescriptor) {
    unsafe {
        core::arch::asm!(
        "invept {0}, [{1}]",
        in(reg) invept_type as u64,
        in(reg) descriptor,
        options(nostack)
        );
    };
}

/// Invalidates the cached translations derived from a single EPT pointer.
///
/// # Arguments
/// * `eptp` - The raw EPTP value as loaded into the VMCS.
pub fn invept_single_context(eptp: u64) {
    invept(InveptType::SingleContext, &InveptDescriptor::new(eptp));
}

/// Invalidates the cached translations derived from every EPT pointer.
pub fn invept_all_contexts() {
    invept(InveptType::AllContexts, &InveptDescriptor::new(0));
}
