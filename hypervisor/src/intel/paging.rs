//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 4.5 4-LEVEL PAGING AND 5-LEVEL PAGING
//!
//! The standard x86-64 paging structures, as used by the host and by guests. Guest tables are
//! only ever read (to translate guest virtual addresses); host tables are also edited to split the
//! 2MB page backing the reserved mapping page.
//!
//! The walk itself is independent of how table memory is reached: it goes through a
//! [`PageTableReader`], which is either the host direct map ([`DirectMap`]) or the mapping window
//! of a `MappingContext` for guest tables.

use {
    crate::{
        error::HypervisorError,
        utils::{
            addresses::AddressTranslation,
            alloc::{try_zeroed_box, Zeroable},
        },
    },
    alloc::boxed::Box,
    bitfield::bitfield,
    static_assertions::const_assert_eq,
    x86::bits64::paging::{
        pd_index, pdpt_index, pml4_index, pt_index, VAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE,
        HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE_ENTRIES,
    },
};

bitfield! {
    /// A 4-level paging entry (PML4E, PDPTE, PDE or PTE).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 4-15 to Table 4-20
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub write_through, set_write_through: 3;
    pub cache_disable, set_cache_disable: 4;
    pub accessed, set_accessed: 5;
    pub dirty, set_dirty: 6;
    /// Page size in a PDPTE/PDE, PAT in a PTE.
    pub large, set_large: 7;
    pub global, set_global: 8;
    /// PAT bit of a 1GB/2MB leaf; part of the frame number everywhere else.
    pub large_pat, set_large_pat: 12;
    pub pfn, set_pfn: 51, 12;
    pub execute_disable, set_execute_disable: 63;
}
const_assert_eq!(core::mem::size_of::<Entry>(), core::mem::size_of::<u64>());

/// A 4KB paging structure.
#[repr(C, align(4096))]
pub struct Table {
    pub entries: [Entry; PAGE_SIZE_ENTRIES],
}
const_assert_eq!(core::mem::size_of::<Table>(), 0x1000);

unsafe impl Zeroable for Table {}

/// The level of a 4-level paging hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Index of the entry translating `va` in a table of this level.
    pub fn index(self, va: u64) -> usize {
        let va = VAddr::from(va);
        match self {
            Level::Pml4 => pml4_index(va),
            Level::Pdpt => pdpt_index(va),
            Level::Pd => pd_index(va),
            Level::Pt => pt_index(va),
        }
    }

    /// The level below this one.
    pub fn next(self) -> Option<Self> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Size of the page a leaf at this level maps.
    pub fn page_size(self) -> u64 {
        match self {
            Level::Pml4 => 0,
            Level::Pdpt => HUGE_PAGE_SIZE as u64,
            Level::Pd => LARGE_PAGE_SIZE as u64,
            Level::Pt => BASE_PAGE_SIZE as u64,
        }
    }
}

/// A paging entry interpreted for the level it lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableEntry {
    NotPresent,
    /// Maps the page at `base` of `size` bytes.
    Leaf { base: u64, size: u64 },
    /// References the next-level table at `table`.
    Pointer { table: u64 },
}

impl Entry {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Classifies the entry. The page-size bit is honoured at the PDPT and PD levels only.
    pub fn kind(&self, level: Level) -> PageTableEntry {
        if !self.present() {
            return PageTableEntry::NotPresent;
        }

        let address = self.pfn() << BASE_PAGE_SHIFT;

        match level {
            Level::Pdpt | Level::Pd if self.large() => {
                let size = level.page_size();
                PageTableEntry::Leaf {
                    base: address & !(size - 1),
                    size,
                }
            }
            Level::Pt => PageTableEntry::Leaf {
                base: address,
                size: BASE_PAGE_SIZE as u64,
            },
            _ => PageTableEntry::Pointer { table: address },
        }
    }
}

/// Reads paging entries by physical address.
pub trait PageTableReader {
    /// Reads the 8-byte entry at physical address `entry_pa`, or `None` if that memory cannot be
    /// reached.
    fn read_entry(&mut self, entry_pa: u64) -> Option<u64>;
}

/// Reads host paging structures through the host's own mapping of physical memory.
pub struct DirectMap<'a, T: AddressTranslation + ?Sized> {
    translation: &'a T,
}

impl<'a, T: AddressTranslation + ?Sized> DirectMap<'a, T> {
    /// # Safety
    ///
    /// Every physical address `translation` resolves must be readable at the returned virtual
    /// address for as long as the reader is used.
    pub unsafe fn new(translation: &'a T) -> Self {
        Self { translation }
    }
}

impl<T: AddressTranslation + ?Sized> PageTableReader for DirectMap<'_, T> {
    fn read_entry(&mut self, entry_pa: u64) -> Option<u64> {
        let va = self.translation.va_from_pa(entry_pa)?;
        Some(unsafe { core::ptr::read_volatile(va as *const u64) })
    }
}

/// Where a page walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    /// Level of the table holding `entry`.
    pub level: Level,
    /// The last entry read: a leaf, or a not-present entry.
    pub entry: Entry,
    /// Physical address of `entry`.
    pub entry_pa: u64,
}

impl Walk {
    pub fn kind(&self) -> PageTableEntry {
        self.entry.kind(self.level)
    }
}

/// Walks the 4-level hierarchy rooted at `table_base` for `va`.
///
/// Stops at the first leaf (1GB and 2MB pages included) or at the first entry that is not
/// present. Returns `None` only if the reader cannot reach a table.
pub fn walk<R: PageTableReader + ?Sized>(reader: &mut R, table_base: u64, va: u64) -> Option<Walk> {
    let mut table = table_base & !(BASE_PAGE_SIZE as u64 - 1);
    let mut level = Level::Pml4;

    loop {
        let entry_pa = table + (level.index(va) * core::mem::size_of::<Entry>()) as u64;
        let entry = Entry::from_raw(reader.read_entry(entry_pa)?);
        let walk = Walk {
            level,
            entry,
            entry_pa,
        };

        match (entry.kind(level), level.next()) {
            (PageTableEntry::Pointer { table: next_table }, Some(next_level)) => {
                table = next_table;
                level = next_level;
            }
            _ => return Some(walk),
        }
    }
}

/// Translates `va` through the hierarchy rooted at `table_base`.
///
/// `None` if any level is not present or cannot be read. Never faults.
pub fn translate<R: PageTableReader + ?Sized>(reader: &mut R, table_base: u64, va: u64) -> Option<u64> {
    match walk(reader, table_base, va)?.kind() {
        PageTableEntry::Leaf { base, size } => Some(base + (va & (size - 1))),
        PageTableEntry::NotPresent | PageTableEntry::Pointer { .. } => None,
    }
}

/// Splits the host 2MB page mapped by the PDE at `pde_pa` into 512 4KB pages.
///
/// The new PTEs carry the PDE's flags (its PAT bit moves to bit 7) and map the same memory, so
/// the translation of every address is unchanged. The page table becomes part of the host
/// paging structures and is never freed.
///
/// # Safety
///
/// `pde_pa` must be the physical address of a present 2MB PDE of the current host hierarchy,
/// reachable through `translation`, and no other processor may edit it concurrently.
pub unsafe fn split_large_pde<T: AddressTranslation + ?Sized>(
    translation: &T,
    pde_pa: u64,
) -> Result<(), HypervisorError> {
    let pde_va = translation
        .va_from_pa(pde_pa)
        .ok_or(HypervisorError::UnsupportedHostMapping)?;
    let pde_ptr = pde_va as *mut u64;
    let pde = Entry::from_raw(core::ptr::read_volatile(pde_ptr));

    let PageTableEntry::Leaf { base, .. } = pde.kind(Level::Pd) else {
        return Err(HypervisorError::UnsupportedHostMapping);
    };

    let mut table = try_zeroed_box::<Table>().ok_or(HypervisorError::NoMemory)?;

    // Flags live in bits 8:0 of both formats; bit 7 changes meaning from PS to PAT.
    let mut template = Entry::from_raw(pde.raw() & 0x1ff);
    template.set_large(pde.large_pat());
    template.set_execute_disable(pde.execute_disable());

    for (i, pte) in table.entries.iter_mut().enumerate() {
        *pte = template;
        pte.set_pfn((base >> BASE_PAGE_SHIFT) + i as u64);
    }

    let table: &'static mut Table = Box::leak(table);
    let table_pa = translation.pa_from_va(table as *mut Table as u64);

    let mut pointer = pde;
    pointer.set_large(false);
    pointer.set_pfn(table_pa >> BASE_PAGE_SHIFT);
    core::ptr::write_volatile(pde_ptr, pointer.raw());

    log::trace!("Split host 2MB page {:#x}, PT at {:#x}", base, table_pa);

    Ok(())
}
