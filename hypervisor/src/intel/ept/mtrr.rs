//! A module for handling Memory Type Range Registers (MTRRs) in x86 systems.
//! It provides the read-only MTRR snapshot consumed while building the EPT identity map,
//! the memory type resolution for a large page, and a reader that takes the snapshot
//! from the variable-range MSRs, following the specifications of the Intel® 64 and IA-32
//! Architectures Software Developer's Manual.

use {
    crate::utils::instructions::rdmsr,
    alloc::vec::Vec,
    bit_field::BitField,
    x86::{
        bits64::paging::LARGE_PAGE_SIZE,
        msr::{IA32_MTRRCAP, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0},
    },
};

/// Represents the different types of memory as defined by MTRRs and EPT leaf entries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Memory type: Uncacheable (UC)
    Uncacheable = 0,
    /// Memory type: Write-combining (WC)
    WriteCombining = 1,
    /// Memory type: Write-through (WT)
    WriteThrough = 4,
    /// Memory type: Write-protected (WP)
    WriteProtected = 5,
    /// Memory type: Write-back (WB)
    WriteBack = 6,
}

impl TryFrom<u8> for MemoryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Uncacheable),
            1 => Ok(Self::WriteCombining),
            4 => Ok(Self::WriteThrough),
            5 => Ok(Self::WriteProtected),
            6 => Ok(Self::WriteBack),
            other => Err(other),
        }
    }
}

/// One entry of the MTRR snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrRange {
    /// Whether the range is enabled. Disabled ranges never affect resolution.
    pub valid: bool,
    /// First physical address of the range.
    pub physical_address_min: u64,
    /// Last physical address of the range (inclusive).
    pub physical_address_max: u64,
    /// The memory type of the range.
    pub memory_type: MemoryType,
}

impl MtrrRange {
    /// Mask for filtering the relevant address bits, aligning to page size (4 KB).
    const ADDR_MASK: u64 = !0xFFF;

    /// Valid bit of IA32_MTRR_PHYSMASKn.
    const MASK_VALID: usize = 11;

    /// Decodes a variable-range MTRR from its IA32_MTRR_PHYSBASEn / IA32_MTRR_PHYSMASKn pair.
    ///
    /// The size of the range is given by the lowest set bit of the mask.
    ///
    /// # Returns
    /// `None` if the base carries a memory type that is not defined for MTRRs.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11.2.3 Variable Range MTRRs
    pub fn from_msrs(base: u64, mask: u64) -> Option<Self> {
        let memory_type = match MemoryType::try_from(base.get_bits(0..8) as u8) {
            Ok(memory_type) => memory_type,
            Err(raw) => {
                log::warn!("Ignoring MTRR with undefined memory type {:#x}", raw);
                return None;
            }
        };

        let physical_address_min = base & Self::ADDR_MASK;
        let size_mask = mask & Self::ADDR_MASK;
        let valid = mask.get_bit(Self::MASK_VALID) && size_mask != 0;

        let physical_address_max = if size_mask != 0 {
            physical_address_min + (1u64 << size_mask.trailing_zeros()) - 1
        } else {
            physical_address_min
        };

        Some(Self {
            valid,
            physical_address_min,
            physical_address_max,
            memory_type,
        })
    }

    /// Whether the range shares at least one byte with the 2MB page starting at `page_address`.
    fn intersects_large_page(&self, page_address: u64) -> bool {
        page_address + (LARGE_PAGE_SIZE as u64 - 1) >= self.physical_address_min
            && page_address <= self.physical_address_max
    }
}

/// Resolves the memory type of the 2MB page starting at `page_address`.
///
/// Write-back unless a valid range touches the page, in which case the last such range in table
/// order decides. Overlapping ranges of different types are architecturally undefined and are
/// not detected.
pub fn resolve_large_page_type(mtrr_table: &[MtrrRange], page_address: u64) -> MemoryType {
    mtrr_table
        .iter()
        .filter(|range| range.valid && range.intersects_large_page(page_address))
        .last()
        .map_or(MemoryType::WriteBack, |range| range.memory_type)
}

/// Retrieves the count of variable range MTRRs.
///
/// # Reference
/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11.1 MTRR Feature Identification
/// - Figure 12-5. IA32_MTRRCAP Register
pub fn variable_range_count() -> u32 {
    rdmsr(IA32_MTRRCAP).get_bits(0..8) as u32
}

/// Takes a snapshot of the variable-range MTRRs of the current processor.
///
/// Must run before the guest is launched; the result is what `EptConfig::initialize` consumes.
pub fn read_variable_ranges() -> Vec<MtrrRange> {
    let mut ranges = Vec::new();

    for index in 0..variable_range_count() {
        let base = rdmsr(IA32_MTRR_PHYSBASE0 + index * 2);
        let mask = rdmsr(IA32_MTRR_PHYSMASK0 + index * 2);

        if let Some(range) = MtrrRange::from_msrs(base, mask) {
            log::info!(
                "MTRR Range: Base={:#x} End={:#x} Type={:?} Valid={}",
                range.physical_address_min,
                range.physical_address_max,
                range.memory_type,
                range.valid
            );
            ranges.push(range);
        }
    }

    log::info!("Total MTRR Ranges Committed: {}", ranges.len());
    ranges
}
