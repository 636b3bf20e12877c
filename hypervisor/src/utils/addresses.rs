//! Abstraction over physical addresses with utility functions for address conversion.
//!
//! This module introduces the `PhysicalAddress` structure that simplifies operations around
//! physical addresses, and the `AddressTranslation` trait through which the rest of the crate
//! converts between host virtual addresses (VAs) and host physical addresses (PAs).

use x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT};

/// Converts between host virtual and host physical addresses.
///
/// The EPT manager needs the physical address of every table it owns, and the host page walk
/// needs to dereference the physical addresses it finds in page-table entries.
pub trait AddressTranslation {
    /// Converts a host virtual address to its corresponding physical address.
    fn pa_from_va(&self, va: u64) -> u64;

    /// Converts a physical address to a host virtual address, or `None` if the page is not
    /// mapped in the host address space.
    fn va_from_pa(&self, pa: u64) -> Option<u64>;
}

/// Address translation for hosts where every physical page is mapped at the same virtual
/// address (UEFI and other pre-OS environments).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapped;

impl AddressTranslation for IdentityMapped {
    fn pa_from_va(&self, va: u64) -> u64 {
        va
    }

    fn va_from_pa(&self, pa: u64) -> Option<u64> {
        (pa != 0).then_some(pa)
    }
}

/// A representation of physical addresses.
///
/// Provides utility methods to work with physical addresses,
/// including page frame number and page offset extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    /// Constructs a `PhysicalAddress` from a given physical address.
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    /// Retrieves the page frame number (PFN) for the physical address.
    pub fn pfn(&self) -> u64 {
        self.0.as_u64() >> BASE_PAGE_SHIFT
    }

    /// Byte offset of the address within its 4KB page.
    pub fn page_offset(&self) -> usize {
        self.0.base_page_offset() as usize
    }

    /// The address rounded down to its 4KB page.
    pub fn page_aligned(&self) -> u64 {
        self.0.align_down_to_base_page().as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_address_into_frame_and_offset() {
        let pa = PhysicalAddress::from_pa(0x1234_5678);
        assert_eq!(pa.pfn(), 0x12345);
        assert_eq!(pa.page_offset(), 0x678);
        assert_eq!(pa.page_aligned(), 0x1234_5000);
    }

    #[test]
    fn identity_translation_round_trips() {
        assert_eq!(IdentityMapped.pa_from_va(0xdead_b000), 0xdead_b000);
        assert_eq!(IdentityMapped.va_from_pa(0xdead_b000), Some(0xdead_b000));
        assert_eq!(IdentityMapped.va_from_pa(0), None);
    }
}
