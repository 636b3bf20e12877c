//! Splitting of 2MB EPT leaves into 512 4KB leaves, so that rights can be set per 4KB page.

use {
    crate::{
        error::HypervisorError,
        intel::ept::{
            paging::{EptEntryKind, EptLevel, Entry, Table},
            EptConfig,
        },
        utils::{addresses::AddressTranslation, alloc::try_zeroed_box},
    },
    alloc::boxed::Box,
};

/// A page table created by splitting one 2MB leaf.
///
/// Owned by the `EptConfig` until it is dropped; there is no merge back into a 2MB page.
pub struct DynamicSplit {
    /// The 512 4KB entries that replaced the 2MB leaf.
    table: Box<Table>,

    /// Physical address of `table`, as stored in the PD entry.
    table_pa: u64,

    pdpt_index: usize,
    pd_index: usize,
}

impl DynamicSplit {
    pub fn table_pa(&self) -> u64 {
        self.table_pa
    }

    /// The PDPT and PD indexes of the 2MB region this table covers.
    pub fn indexes(&self) -> (usize, usize) {
        (self.pdpt_index, self.pd_index)
    }

    pub fn entry(&self, pt_index: usize) -> &Entry {
        &self.table.entries[pt_index]
    }

    pub fn entry_mut(&mut self, pt_index: usize) -> &mut Entry {
        &mut self.table.entries[pt_index]
    }
}

impl EptConfig {
    /// Replaces the 2MB leaf covering `guest_pa` with a table of 512 4KB leaves.
    ///
    /// Each new leaf keeps the access rights, memory type, ignore-PAT and suppress-#VE bits of the
    /// large page and maps the matching 4KB of it, so translation is unchanged. The caller still has
    /// to invalidate the EPT (see [`EptConfig::invalidate_and_flush`]).
    ///
    /// # Errors
    /// - `InvalidAddress` if `guest_pa` is above 512GB or not mapped at all.
    /// - `AlreadyComplete` if the region was already split.
    /// - `NoMemory` if the table or its bookkeeping cannot be allocated. Nothing is changed then.
    pub fn split_large_page<T: AddressTranslation + ?Sized>(
        &mut self,
        guest_pa: u64,
        translation: &T,
    ) -> Result<(), HypervisorError> {
        let (pdpt, pd) = Self::upper_indexes(guest_pa).ok_or(HypervisorError::InvalidAddress)?;
        let large_page = self.tables.pd[pdpt].entries[pd];

        match large_page.kind(EptLevel::Pd) {
            EptEntryKind::Leaf { .. } => {}
            EptEntryKind::Pointer { .. } => return Err(HypervisorError::AlreadyComplete),
            EptEntryKind::NotPresent => return Err(HypervisorError::InvalidAddress),
        }

        self.splits
            .try_reserve(1)
            .map_err(|_| HypervisorError::NoMemory)?;
        let mut table = try_zeroed_box::<Table>().ok_or(HypervisorError::NoMemory)?;

        let mut template = Entry::default();
        template.set_readable(large_page.readable());
        template.set_writable(large_page.writable());
        template.set_executable(large_page.executable());
        template.set_memory_type(large_page.memory_type());
        template.set_ignore_pat(large_page.ignore_pat());
        template.set_suppress_ve(large_page.suppress_ve());

        for (i, pte) in table.entries.iter_mut().enumerate() {
            *pte = template;
            pte.set_pfn(large_page.pfn() + i as u64);
        }

        let table_pa = translation.pa_from_va(table.as_ref() as *const Table as u64);

        // The pointer carries no memory type and has the large bit cleared.
        self.tables.pd[pdpt].entries[pd] = Entry::pointer(table_pa);

        self.splits.push(DynamicSplit {
            table,
            table_pa,
            pdpt_index: pdpt,
            pd_index: pd,
        });

        log::trace!(
            "Split 2MB page at {:#x} into 4KB pages, PT at {:#x}",
            large_page.address(),
            table_pa
        );

        Ok(())
    }
}
