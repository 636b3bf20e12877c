//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//! The extended page-table mechanism (EPT) is a feature that can be used to support the virtualization of physical memory.
//! When EPT is in use, certain addresses that would normally be treated as physical addresses (and used to access memory) are instead treated as guest-physical addresses
//! Guest-physical addresses are translated by traversing a set of EPT paging structures to produce physical addresses that are used to access memory.
//!
//! `EptConfig` owns the whole hierarchy of one virtual machine. Only the first PML4 entry is
//! used, so the identity map covers the first 512GB of guest-physical memory with 2MB pages;
//! individual 2MB pages are split into 4KB pages on demand (see [`split`]).
//!
//! Nothing in here synchronizes with other logical processors. Callers editing the tables while
//! other processors run the guest must serialize those edits themselves.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::{
                access::{AccessType, _512GB},
                mtrr::{resolve_large_page_type, MemoryType, MtrrRange},
                paging::{EptEntryKind, EptLevel, EptPointer, Entry, Table},
                split::DynamicSplit,
                violation::ViolationHandler,
            },
            invept::invept_single_context,
        },
        utils::{
            addresses::AddressTranslation,
            alloc::{try_zeroed_box, Zeroable},
        },
    },
    alloc::{boxed::Box, vec::Vec},
    core::ptr::addr_of,
    elain::Align,
    static_assertions::const_assert_eq,
    x86::bits64::paging::{
        pd_index, pdpt_index, pt_index, VAddr, BASE_PAGE_SHIFT, LARGE_PAGE_SIZE,
        PAGE_SIZE_ENTRIES,
    },
};

pub mod access;
pub mod mtrr;
pub mod paging;
pub mod split;
pub mod violation;

/// Guest-physical addresses at or above this limit are not translated by this EPT.
pub const EPT_SUPPORTED_LIMIT: u64 = _512GB;

/// The paging structures of the identity map.
///
/// # Fields
/// - `pml4`: The Page Map Level 4 (PML4) table. Only entry 0 is used.
/// - `pdpt`: The Page Directory Pointer Table (PDPT), one pointer per 1GB.
/// - `pd`: An array of Page Directory Tables (PDT), one 2MB leaf (or split pointer) per entry.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
#[repr(C, align(4096))]
pub struct EptTables {
    pub pml4: Table,
    align_0: Align<4096>,

    pub pdpt: Table,
    align_1: Align<4096>,

    pub pd: [Table; PAGE_SIZE_ENTRIES],
}
const_assert_eq!(core::mem::size_of::<EptTables>(), 0x202000);

unsafe impl Zeroable for EptTables {}

/// The root of one virtual machine's guest-physical to host-physical translation.
pub struct EptConfig {
    /// The PML4, PDPT and PDs. Boxed so their physical addresses never change.
    tables: Box<EptTables>,

    /// The EPT pointer describing `tables.pml4`, valid after `initialize`.
    eptp: EptPointer,

    /// Registered violation handlers, oldest first. Dispatch walks them newest first.
    handlers: Vec<ViolationHandler>,

    /// Every 4KB table created by splitting a 2MB page.
    splits: Vec<DynamicSplit>,

    /// Violations that ended up reported as unhandled.
    unhandled_violations: usize,
}

impl EptConfig {
    /// Allocates an empty EPT hierarchy.
    ///
    /// # Errors
    /// `NoMemory` if the paging structures cannot be allocated.
    pub fn new() -> Result<Self, HypervisorError> {
        let tables = try_zeroed_box::<EptTables>().ok_or(HypervisorError::NoMemory)?;

        Ok(Self {
            tables,
            eptp: EptPointer::default(),
            handlers: Vec::new(),
            splits: Vec::new(),
            unhandled_violations: 0,
        })
    }

    /// Builds an identity map for the first 512GB of guest-physical memory.
    ///
    /// Every 2MB page is mapped read/write/execute. Its memory type is write-back unless a valid
    /// range of `mtrr_table` touches the page, in which case the last such range decides.
    ///
    /// Must run before the guest executes with this EPT. Running it again discards all splits and
    /// registered handlers.
    ///
    /// # Arguments
    /// * `mtrr_table` - Snapshot of the MTRRs, see [`mtrr::read_variable_ranges`].
    /// * `translation` - Converts the addresses of the tables to physical addresses.
    pub fn initialize<T: AddressTranslation + ?Sized>(
        &mut self,
        mtrr_table: &[MtrrRange],
        translation: &T,
    ) -> Result<(), HypervisorError> {
        log::info!("Initialising the EPT for the virtual machine");

        self.handlers.clear();
        self.splits.clear();

        let pml4_pa = translation.pa_from_va(addr_of!(self.tables.pml4) as u64);
        self.eptp = Self::create_eptp_with_wb_and_4lvl_walk(pml4_pa)?;

        // The PML4 covers the first 512GB of RAM with its first entry.
        let pdpt_pa = translation.pa_from_va(addr_of!(self.tables.pdpt) as u64);
        self.tables.pml4.entries[0] = Entry::pointer(pdpt_pa);

        for i in 0..PAGE_SIZE_ENTRIES {
            let pd_pa = translation.pa_from_va(addr_of!(self.tables.pd[i]) as u64);
            self.tables.pdpt.entries[i] = Entry::pointer(pd_pa);

            for (j, pde) in self.tables.pd[i].entries.iter_mut().enumerate() {
                let large_page_address = ((i * PAGE_SIZE_ENTRIES + j) * LARGE_PAGE_SIZE) as u64;
                let memory_type = resolve_large_page_type(mtrr_table, large_page_address);

                *pde = Entry::default();
                pde.set_readable(true);
                pde.set_writable(true);
                pde.set_executable(true);
                pde.set_large(true);
                pde.set_memory_type(memory_type as u64);
                pde.set_pfn(large_page_address >> BASE_PAGE_SHIFT);
            }
        }

        log::info!("Identity map for EPT built successfully! EPTP: {:#x}", self.eptp.raw());

        Ok(())
    }

    /// Creates an Extended Page Table Pointer (EPTP) with a Write-Back memory type and a 4-level page walk.
    ///
    /// # Returns
    /// The configured EPTP, or `InvalidEptPml4BaseAddress` if the PML4 is not 4KB aligned.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub fn create_eptp_with_wb_and_4lvl_walk(
        ept_pml4_base_addr: u64,
    ) -> Result<EptPointer, HypervisorError> {
        // The EPTP encodes "number of levels minus one".
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3;

        if ept_pml4_base_addr.trailing_zeros() < BASE_PAGE_SHIFT as u32 {
            return Err(HypervisorError::InvalidEptPml4BaseAddress);
        }

        let mut eptp = EptPointer::default();
        eptp.set_memory_type(MemoryType::WriteBack as u64);
        eptp.set_page_walk_length(EPT_PAGE_WALK_LENGTH_4);
        eptp.set_pfn(ept_pml4_base_addr >> BASE_PAGE_SHIFT);
        Ok(eptp)
    }

    /// The EPT pointer to load into the VMCS for this hierarchy.
    pub fn eptp(&self) -> EptPointer {
        self.eptp
    }

    /// Read-only access to the paging structures.
    pub fn tables(&self) -> &EptTables {
        &self.tables
    }

    /// Number of 2MB pages split so far.
    pub fn split_count(&self) -> usize {
        self.splits.len()
    }

    /// PDPT and PD indexes of `guest_pa`, or `None` at and above 512GB.
    fn upper_indexes(guest_pa: u64) -> Option<(usize, usize)> {
        // The index helpers only look at bits 47:12, compare the whole address.
        if guest_pa >= EPT_SUPPORTED_LIMIT {
            return None;
        }

        let guest_pa = VAddr::from(guest_pa);
        Some((pdpt_index(guest_pa), pd_index(guest_pa)))
    }

    /// Returns the PD entry covering `guest_pa`: a 2MB leaf, or the pointer that replaced it.
    ///
    /// `None` above 512GB.
    pub fn upper_leaf_from_address(&self, guest_pa: u64) -> Option<&Entry> {
        let (pdpt, pd) = Self::upper_indexes(guest_pa)?;
        Some(&self.tables.pd[pdpt].entries[pd])
    }

    /// Mutable variant of [`Self::upper_leaf_from_address`].
    pub fn upper_leaf_from_address_mut(&mut self, guest_pa: u64) -> Option<&mut Entry> {
        let (pdpt, pd) = Self::upper_indexes(guest_pa)?;
        Some(&mut self.tables.pd[pdpt].entries[pd])
    }

    /// Index into `splits` of the table the PD entry for `guest_pa` points at.
    fn split_for(&self, guest_pa: u64) -> Option<usize> {
        let (pdpt, pd) = Self::upper_indexes(guest_pa)?;

        match self.tables.pd[pdpt].entries[pd].kind(EptLevel::Pd) {
            EptEntryKind::Pointer { table } => self
                .splits
                .iter()
                .position(|split| split.indexes() == (pdpt, pd) && split.table_pa() == table),
            EptEntryKind::Leaf { .. } | EptEntryKind::NotPresent => None,
        }
    }

    /// Returns the 4KB PT entry mapping `guest_pa`.
    ///
    /// `None` above 512GB and while the region is still mapped by a 2MB leaf.
    pub fn lowest_entry_from_address(&self, guest_pa: u64) -> Option<&Entry> {
        let index = self.split_for(guest_pa)?;
        Some(self.splits[index].entry(pt_index(VAddr::from(guest_pa))))
    }

    /// Mutable variant of [`Self::lowest_entry_from_address`].
    pub fn lowest_entry_from_address_mut(&mut self, guest_pa: u64) -> Option<&mut Entry> {
        let index = self.split_for(guest_pa)?;
        Some(self.splits[index].entry_mut(pt_index(VAddr::from(guest_pa))))
    }

    /// Changes the access rights of the page mapping `guest_pa`.
    ///
    /// Edits the 4KB entry if the region was split, the whole 2MB leaf otherwise. The change is not
    /// visible to the guest until [`Self::invalidate_and_flush`] runs.
    ///
    /// # Errors
    /// `InvalidAddress` above 512GB.
    pub fn set_permissions(
        &mut self,
        guest_pa: u64,
        access_type: AccessType,
    ) -> Result<(), HypervisorError> {
        log::trace!("Changing permission of guest page {:#x} to {:?}", guest_pa, access_type);

        if let Some(pte) = self.lowest_entry_from_address_mut(guest_pa) {
            access_type.apply(pte);
            return Ok(());
        }

        let pde = self
            .upper_leaf_from_address_mut(guest_pa)
            .ok_or(HypervisorError::InvalidAddress)?;
        access_type.apply(pde);

        Ok(())
    }

    /// Invalidates the cached translations derived from this EPT (single-context INVEPT).
    ///
    /// Required after any split or permission edit before the guest can rely on it.
    pub fn invalidate_and_flush(&self) {
        invept_single_context(self.eptp.raw());
    }

    /// Logs the PD entry and, if split, the PT entry translating `guest_pa`.
    pub fn dump_entries(&self, guest_pa: u64) {
        match self.upper_leaf_from_address(guest_pa) {
            Some(pde) => log::error!("PDEntry: {:x?}", pde),
            None => log::error!("No EPT entry above 512GB: {:#x}", guest_pa),
        }

        if let Some(pte) = self.lowest_entry_from_address(guest_pa) {
            log::error!("PTEntry: {:x?}", pte);
        }
    }
}
