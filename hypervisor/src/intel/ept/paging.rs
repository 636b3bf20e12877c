//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
//!
//! Bit-exact layouts of the EPT paging-structure entries and of the EPT pointer (EPTP).
//! Every level shares one 64-bit entry format; which fields are meaningful depends on the
//! level and on the large-page bit, so entries are classified into an [`EptEntryKind`]
//! before they are interpreted.

use {
    crate::utils::alloc::Zeroable,
    bitfield::bitfield,
    static_assertions::const_assert_eq,
    x86::bits64::paging::{BASE_PAGE_SHIFT, PAGE_SIZE_ENTRIES},
};

/// A single 4KB EPT paging structure (PML4, PDPT, PD or PT).
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub entries: [Entry; PAGE_SIZE_ENTRIES],
}
const_assert_eq!(core::mem::size_of::<Table>(), 0x1000);

unsafe impl Zeroable for Table {}

bitfield! {
    /// Represents an Extended Page Table Entry (EPT Entry).
    ///
    /// # Fields
    ///
    /// * `readable`, `writable`, `executable` - Access rights for the region the entry controls.
    /// * `memory_type` - EPT memory type of a leaf (bits 5:3, reserved in pointer entries).
    /// * `ignore_pat` - Ignore the guest PAT memory type for a leaf.
    /// * `large` - Set in a PDPTE/PDE that maps a 1GB/2MB page instead of referencing a table.
    /// * `pfn` - Page frame number (4KB units) of the referenced table or mapped page.
    /// * `suppress_ve` - Suppress #VE for violations on this leaf.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 29-1 to Table 29-6
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub user_executable, set_user_executable: 10;
    pub pfn, set_pfn: 51, 12;
    pub verify_guest_paging, set_verify_guest_paging: 57;
    pub paging_write_access, set_paging_write_access: 58;
    pub suppress_ve, set_suppress_ve: 63;
}
const_assert_eq!(core::mem::size_of::<Entry>(), core::mem::size_of::<u64>());

/// The level of the EPT hierarchy an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

/// An EPT entry interpreted for the level it lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptEntryKind {
    /// The entry has never been filled in.
    NotPresent,
    /// The entry maps a page starting at host physical address `base`.
    Leaf { base: u64 },
    /// The entry references the next-level table at host physical address `table`.
    Pointer { table: u64 },
}

impl Entry {
    /// Creates an entry from its raw 64-bit value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value of the entry.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Physical address the entry's frame number designates.
    pub fn address(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    /// Classifies the entry.
    ///
    /// Access bits do not decide presence: a leaf whose R/W/X bits were all cleared to trap every
    /// access still owns its frame and memory type.
    pub fn kind(&self, level: EptLevel) -> EptEntryKind {
        if self.0 == 0 {
            return EptEntryKind::NotPresent;
        }

        match level {
            EptLevel::Pt => EptEntryKind::Leaf { base: self.address() },
            EptLevel::Pdpt | EptLevel::Pd if self.large() => EptEntryKind::Leaf { base: self.address() },
            _ => EptEntryKind::Pointer { table: self.address() },
        }
    }

    /// Builds a read/write/execute entry that references the table at `table_pa`.
    pub fn pointer(table_pa: u64) -> Self {
        let mut entry = Self(0);
        entry.set_readable(true);
        entry.set_writable(true);
        entry.set_executable(true);
        entry.set_pfn(table_pa >> BASE_PAGE_SHIFT);
        entry
    }
}

bitfield! {
    /// Extended-Page-Table Pointer (EPTP), written to the VMCS and used as the INVEPT context.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-9. Format of Extended-Page-Table Pointer
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptPointer(u64);
    impl Debug;

    pub memory_type, set_memory_type: 2, 0;
    pub page_walk_length, set_page_walk_length: 5, 3;
    pub access_dirty, set_access_dirty: 6;
    pub supervisor_shadow_stack, set_supervisor_shadow_stack: 7;
    pub pfn, set_pfn: 51, 12;
}

impl EptPointer {
    /// Returns the raw value of the pointer as loaded into the VMCS.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}
