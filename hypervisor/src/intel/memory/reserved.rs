//! The mapping window of a real host: a reserved virtual page whose PTE is edited in place.

use {
    crate::{
        error::HypervisorError,
        intel::{
            memory::MappingWindow,
            paging::{self, split_large_pde, DirectMap, Entry, Level, PageTableEntry},
        },
        utils::{addresses::AddressTranslation, instructions::invlpg},
    },
    core::ptr,
};

/// A host virtual page reserved for one logical processor, together with the PTE backing it.
pub struct ReservedPage {
    va: u64,
    pte: *mut u64,
    mapped: Option<u64>,
}

impl ReservedPage {
    /// Locates the PTE backing the reserved page `va` in the host hierarchy rooted at `host_cr3`
    /// and clears it.
    ///
    /// If `va` lies in a 2MB host page, that page is split first so the window gets a PTE of its
    /// own.
    ///
    /// # Errors
    /// - `UnsupportedHostMapping` if no PTE can back `va` (an upper level is not present, or `va`
    ///   is in a 1GB page).
    /// - `NoMemory` if the page table for the split cannot be allocated.
    ///
    /// # Safety
    ///
    /// `va` must be reserved for the exclusive use of the caller, `host_cr3` must be the current
    /// host hierarchy, and every host paging structure must be reachable through `translation`.
    pub unsafe fn new<T: AddressTranslation + ?Sized>(
        host_cr3: u64,
        va: u64,
        translation: &T,
    ) -> Result<Self, HypervisorError> {
        let mut reader = DirectMap::new(translation);
        let mut walk = paging::walk(&mut reader, host_cr3, va)
            .ok_or(HypervisorError::UnsupportedHostMapping)?;

        if let (Level::Pd, PageTableEntry::Leaf { .. }) = (walk.level, walk.kind()) {
            log::info!("Reserved page {:#x} is in a 2MB page, splitting it", va);
            split_large_pde(translation, walk.entry_pa)?;

            walk = paging::walk(&mut reader, host_cr3, va)
                .ok_or(HypervisorError::UnsupportedHostMapping)?;
        }

        if walk.level != Level::Pt {
            log::error!("Reserved page {:#x} stops at {:?}: {:x?}", va, walk.level, walk.entry);
            return Err(HypervisorError::UnsupportedHostMapping);
        }

        let pte = translation
            .va_from_pa(walk.entry_pa)
            .ok_or(HypervisorError::UnsupportedHostMapping)? as *mut u64;
        ptr::write_volatile(pte, 0);

        log::info!("Reserved page {:#x} uses PTE at {:#x}", va, walk.entry_pa);

        Ok(Self {
            va,
            pte,
            mapped: None,
        })
    }

    /// The reserved virtual address.
    pub fn va(&self) -> u64 {
        self.va
    }
}

impl MappingWindow for ReservedPage {
    fn install(&mut self, pfn: u64) {
        let mut entry = Entry::default();
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_pfn(pfn);

        unsafe { ptr::write_volatile(self.pte, entry.raw()) };
        invlpg(self.va);
        self.mapped = Some(pfn);
    }

    fn clear(&mut self) {
        unsafe { ptr::write_volatile(self.pte, 0) };
        invlpg(self.va);
        self.mapped = None;
    }

    fn base(&mut self) -> *mut u8 {
        self.va as *mut u8
    }

    fn mapped_pfn(&self) -> Option<u64> {
        self.mapped
    }
}
