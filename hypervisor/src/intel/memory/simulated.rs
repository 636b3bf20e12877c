//! A mapping window over simulated physical memory, with helpers to lay out guest page tables in
//! it.

use {
    crate::intel::{memory::MappingWindow, paging::Level},
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE},
};

type Frame = Box<[u8; BASE_PAGE_SIZE]>;

/// Physical memory is a sparse map of 4KB frames, zero until written.
pub(crate) struct SimulatedWindow {
    frames: BTreeMap<u64, Frame>,
    /// What the window shows while nothing is mapped.
    unmapped: Frame,
    mapped: Option<u64>,
    next_table: u64,
    installs: usize,
    clears: usize,
}

const PRESENT_WRITABLE: u64 = 0b11;
const LARGE: u64 = 1 << 7;
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

impl SimulatedWindow {
    pub(crate) fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            unmapped: Box::new([0xcc; BASE_PAGE_SIZE]),
            mapped: None,
            next_table: 0x100_0000,
            installs: 0,
            clears: 0,
        }
    }

    fn frame(&mut self, pfn: u64) -> &mut Frame {
        self.frames
            .entry(pfn)
            .or_insert_with(|| Box::new([0; BASE_PAGE_SIZE]))
    }

    pub(crate) fn installs(&self) -> usize {
        self.installs
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears
    }

    pub(crate) fn write_bytes(&mut self, pa: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let pa = pa + i as u64;
            self.frame(pa >> BASE_PAGE_SHIFT)[pa as usize & (BASE_PAGE_SIZE - 1)] = *byte;
        }
    }

    pub(crate) fn read_bytes(&mut self, pa: u64, length: usize) -> Vec<u8> {
        (pa..pa + length as u64)
            .map(|pa| self.frame(pa >> BASE_PAGE_SHIFT)[pa as usize & (BASE_PAGE_SIZE - 1)])
            .collect()
    }

    pub(crate) fn write_u64(&mut self, pa: u64, value: u64) {
        self.write_bytes(pa, &value.to_le_bytes());
    }

    pub(crate) fn read_u64(&mut self, pa: u64) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.read_bytes(pa, 8));
        u64::from_le_bytes(raw)
    }

    /// Allocates a zeroed page table above the simulated data pages.
    pub(crate) fn new_table(&mut self) -> u64 {
        let table = self.next_table;
        self.next_table += BASE_PAGE_SIZE as u64;
        self.frame(table >> BASE_PAGE_SHIFT);
        table
    }

    /// Returns the table the entry at `entry_pa` points to, creating it if the entry is empty.
    fn next_level(&mut self, entry_pa: u64) -> u64 {
        let entry = self.read_u64(entry_pa);
        if entry & 1 != 0 {
            return entry & ADDRESS_MASK;
        }

        let table = self.new_table();
        self.write_u64(entry_pa, table | PRESENT_WRITABLE);
        table
    }

    fn entry_pa(table: u64, level: Level, va: u64) -> u64 {
        table + level.index(va) as u64 * 8
    }

    /// Maps the guest 4KB page `va` to `pa` in the hierarchy rooted at `table_base`.
    pub(crate) fn map_guest_page(&mut self, table_base: u64, va: u64, pa: u64) {
        let pdpt = self.next_level(Self::entry_pa(table_base, Level::Pml4, va));
        let pd = self.next_level(Self::entry_pa(pdpt, Level::Pdpt, va));
        let pt = self.next_level(Self::entry_pa(pd, Level::Pd, va));
        self.write_u64(Self::entry_pa(pt, Level::Pt, va), pa | PRESENT_WRITABLE);
    }

    /// Maps the guest 2MB page `va` to `pa` in the hierarchy rooted at `table_base`.
    pub(crate) fn map_guest_large_page(&mut self, table_base: u64, va: u64, pa: u64) {
        let pdpt = self.next_level(Self::entry_pa(table_base, Level::Pml4, va));
        let pd = self.next_level(Self::entry_pa(pdpt, Level::Pdpt, va));
        self.write_u64(Self::entry_pa(pd, Level::Pd, va), pa | PRESENT_WRITABLE | LARGE);
    }
}

impl MappingWindow for SimulatedWindow {
    fn install(&mut self, pfn: u64) {
        self.frame(pfn);
        self.mapped = Some(pfn);
        self.installs += 1;
    }

    fn clear(&mut self) {
        self.mapped = None;
        self.clears += 1;
    }

    fn base(&mut self) -> *mut u8 {
        match self.mapped {
            Some(pfn) => self.frame(pfn).as_mut_ptr(),
            None => self.unmapped.as_mut_ptr(),
        }
    }

    fn mapped_pfn(&self) -> Option<u64> {
        self.mapped
    }
}
