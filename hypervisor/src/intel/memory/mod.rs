//! Access to arbitrary guest memory from VMX root.
//!
//! A [`MappingContext`] owns one host virtual page (the window) whose page-table entry is
//! reprogrammed to point at whatever physical page has to be read or written. Guest virtual
//! addresses are translated by walking the guest's own page tables through that same window.
//!
//! One context exists per logical processor and is passed by reference; it is never shared.
//! Guest-physical addresses are used as host-physical addresses, which holds under the identity
//! EPT built by `EptConfig::initialize`.

use {
    crate::{
        error::HypervisorError,
        intel::paging::{self, PageTableReader},
        utils::addresses::PhysicalAddress,
    },
    core::ops::Range,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

pub mod process;
pub mod reserved;
#[cfg(test)]
pub(crate) mod simulated;

/// A single host virtual page that can be pointed at any physical page.
pub trait MappingWindow {
    /// Maps the physical page `pfn` present and writable at [`Self::base`] and discards any
    /// cached translation of the window.
    fn install(&mut self, pfn: u64);

    /// Removes the mapping and discards the cached translation.
    fn clear(&mut self);

    /// Host virtual address of the window.
    fn base(&mut self) -> *mut u8;

    /// The physical page currently mapped, if any.
    fn mapped_pfn(&self) -> Option<u64>;
}

/// Per-processor state for guest memory access.
pub struct MappingContext<W: MappingWindow> {
    window: W,
}

/// A physical page mapped into the window. Dropping it unmaps the page.
pub struct MappedPage<'a, W: MappingWindow> {
    window: &'a mut W,
    address: *mut u8,
    remaining: usize,
}

impl<W: MappingWindow> MappedPage<'_, W> {
    /// Host virtual address of the mapped physical address (window base plus in-page offset).
    pub fn as_ptr(&self) -> *mut u8 {
        self.address
    }

    /// Bytes from the mapped address to the end of its page.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Copies `buffer.len()` bytes out of the mapped page.
    pub fn read(&self, buffer: &mut [u8]) -> Result<(), HypervisorError> {
        if buffer.len() > self.remaining {
            return Err(HypervisorError::InvalidParameter);
        }

        unsafe { core::ptr::copy_nonoverlapping(self.address, buffer.as_mut_ptr(), buffer.len()) };
        Ok(())
    }

    /// Copies `buffer` into the mapped page.
    pub fn write(&mut self, buffer: &[u8]) -> Result<(), HypervisorError> {
        if buffer.len() > self.remaining {
            return Err(HypervisorError::InvalidParameter);
        }

        unsafe { core::ptr::copy_nonoverlapping(buffer.as_ptr(), self.address, buffer.len()) };
        Ok(())
    }

    /// Unmaps the page.
    pub fn unmap(self) {}
}

impl<W: MappingWindow> Drop for MappedPage<'_, W> {
    fn drop(&mut self) {
        self.window.clear();
    }
}

impl<W: MappingWindow> MappingContext<W> {
    pub fn new(window: W) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    /// Releases the window.
    pub fn into_window(self) -> W {
        self.window
    }

    /// Maps the page containing `pa` into the window.
    ///
    /// The mapping lasts until the returned guard is dropped; the context cannot be used for
    /// anything else in the meantime.
    pub fn map(&mut self, pa: u64) -> MappedPage<'_, W> {
        let pa = PhysicalAddress::from_pa(pa);
        self.window.install(pa.pfn());

        log::trace!("Mapped physical page {:#x}", pa.page_aligned());

        let offset = pa.page_offset();
        let address = unsafe { self.window.base().add(offset) };

        MappedPage {
            window: &mut self.window,
            address,
            remaining: BASE_PAGE_SIZE - offset,
        }
    }

    /// Reads `buffer.len()` bytes at physical address `pa`.
    ///
    /// # Errors
    /// `InvalidParameter` if the range crosses the end of the page containing `pa`.
    pub fn read_physical(&mut self, pa: u64, buffer: &mut [u8]) -> Result<(), HypervisorError> {
        self.map(pa).read(buffer)
    }

    /// Writes `buffer` at physical address `pa`.
    ///
    /// # Errors
    /// `InvalidParameter` if the range crosses the end of the page containing `pa`.
    pub fn write_physical(&mut self, pa: u64, buffer: &[u8]) -> Result<(), HypervisorError> {
        self.map(pa).write(buffer)
    }

    /// Translates the guest virtual address `gva` through the guest tables rooted at `table_base`.
    pub fn translate(&mut self, table_base: u64, gva: u64) -> Option<u64> {
        paging::translate(self, table_base, gva)
    }

    /// Reads `buffer.len()` bytes of guest virtual memory starting at `gva`.
    ///
    /// Every page is translated on its own, so the range may be physically discontiguous.
    ///
    /// # Errors
    /// `Unsuccessful` if a page is not mapped by the guest. The bytes of the pages before it have
    /// already been copied.
    pub fn read_virtual(
        &mut self,
        table_base: u64,
        gva: u64,
        buffer: &mut [u8],
    ) -> Result<(), HypervisorError> {
        for (va, span) in page_spans(gva, buffer.len()) {
            let pa = self.translate_chunk(table_base, va)?;
            self.read_physical(pa, &mut buffer[span])?;
        }

        Ok(())
    }

    /// Writes `buffer` to guest virtual memory starting at `gva`.
    ///
    /// # Errors
    /// `Unsuccessful` if a page is not mapped by the guest. The pages before it have already been
    /// written and are left as they are.
    pub fn write_virtual(
        &mut self,
        table_base: u64,
        gva: u64,
        buffer: &[u8],
    ) -> Result<(), HypervisorError> {
        for (va, span) in page_spans(gva, buffer.len()) {
            let pa = self.translate_chunk(table_base, va)?;
            self.write_physical(pa, &buffer[span])?;
        }

        Ok(())
    }

    fn translate_chunk(&mut self, table_base: u64, gva: u64) -> Result<u64, HypervisorError> {
        self.translate(table_base, gva).ok_or_else(|| {
            log::trace!("Guest virtual address {:#x} is not mapped", gva);
            HypervisorError::Unsuccessful
        })
    }
}

/// Guest page tables are read through the window, one entry at a time.
impl<W: MappingWindow> PageTableReader for MappingContext<W> {
    fn read_entry(&mut self, entry_pa: u64) -> Option<u64> {
        let mut raw = [0u8; 8];
        self.read_physical(entry_pa, &mut raw).ok()?;
        Some(u64::from_le_bytes(raw))
    }
}

/// Bytes that can be transferred at `va` without crossing into the next page.
fn chunk_length(va: u64, length: usize) -> usize {
    let to_page_end = BASE_PAGE_SIZE - (va as usize & (BASE_PAGE_SIZE - 1));
    length.min(to_page_end)
}

/// Splits a transfer of `length` bytes at `va` into spans that each stay within one page.
///
/// Yields the address of each span and its range in the caller's buffer. The address wraps, so a
/// transfer may end exactly at the top of the address space.
fn page_spans(va: u64, length: usize) -> impl Iterator<Item = (u64, Range<usize>)> {
    let mut offset = 0;

    core::iter::from_fn(move || {
        if offset == length {
            return None;
        }

        let address = va.wrapping_add(offset as u64);
        let span = offset..offset + chunk_length(address, length - offset);
        offset = span.end;

        Some((address, span))
    })
}

#[cfg(test)]
mod tests {
    use {
        super::{simulated::SimulatedWindow, *},
        alloc::vec,
    };

    #[test]
    fn map_exposes_the_in_page_offset() {
        let mut window = SimulatedWindow::new();
        window.write_bytes(0x7000, &[0xaa; 0x10]);
        window.write_bytes(0x7ff8, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut context = MappingContext::new(window);
        {
            let page = context.map(0x7ff8);
            assert_eq!(page.remaining(), 8);

            let mut bytes = [0u8; 8];
            page.read(&mut bytes).unwrap();
            assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
            assert_eq!(unsafe { *page.as_ptr() }, 1);
        }

        assert_eq!(context.window().mapped_pfn(), None);
    }

    #[test]
    fn physical_access_stays_within_one_page() {
        let mut context = MappingContext::new(SimulatedWindow::new());
        let mut buffer = [0u8; 0x10];

        assert_eq!(
            context.read_physical(0x1ff8, &mut buffer),
            Err(HypervisorError::InvalidParameter)
        );
        assert_eq!(
            context.write_physical(0x1ff8, &buffer),
            Err(HypervisorError::InvalidParameter)
        );
        assert_eq!(context.window().mapped_pfn(), None);

        context.write_physical(0x1ff0, b"0123456789abcdef").unwrap();
        context.read_physical(0x1ff0, &mut buffer).unwrap();
        assert_eq!(&buffer, b"0123456789abcdef");
    }

    #[test]
    fn no_stale_translation_after_unmap() {
        let mut context = MappingContext::new(SimulatedWindow::new());

        let page = context.map(0x3000);
        page.unmap();
        assert_eq!(context.window().mapped_pfn(), None);

        context.write_physical(0x4000, &[0x11; 4]).unwrap();
        assert_eq!(context.window().mapped_pfn(), None);
        assert_eq!(context.window().installs(), 2);
        assert_eq!(context.window().clears(), 2);

        // A read through the window after unmapping sees nothing of the last page.
        let mut window = context.into_window();
        let base = window.base();
        assert_ne!(unsafe { *base }, 0x11);
    }

    const GUEST_VA: u64 = 0x7ff6_1234_0000;

    /// Three consecutive guest pages backed by scattered physical pages.
    fn scattered_guest() -> (MappingContext<SimulatedWindow>, u64) {
        let mut window = SimulatedWindow::new();
        let table_base = window.new_table();
        window.map_guest_page(table_base, GUEST_VA, 0x5_0000);
        window.map_guest_page(table_base, GUEST_VA + 0x1000, 0x9_3000);
        window.map_guest_page(table_base, GUEST_VA + 0x2000, 0x2_1000);
        (MappingContext::new(window), table_base)
    }

    #[test]
    fn virtual_round_trip_across_scattered_pages() {
        let (mut context, table_base) = scattered_guest();
        let data: alloc::vec::Vec<u8> = (0..0x2000u32).map(|i| (i * 7) as u8).collect();

        context.write_virtual(table_base, GUEST_VA + 0xf00, &data).unwrap();

        let mut read_back = vec![0u8; data.len()];
        context.read_virtual(table_base, GUEST_VA + 0xf00, &mut read_back).unwrap();
        assert_eq!(read_back, data);

        let mut window = context.into_window();
        assert_eq!(window.read_bytes(0x5_0f00, 0x100), data[..0x100]);
        assert_eq!(window.read_bytes(0x9_3000, 0x1000), data[0x100..0x1100]);
        assert_eq!(window.read_bytes(0x2_1000, 0xf00), data[0x1100..]);
        assert_eq!(window.mapped_pfn(), None);
        assert_eq!(window.installs(), window.clears());
    }

    #[test]
    fn virtual_write_stops_at_first_unmapped_page() {
        let mut window = SimulatedWindow::new();
        let table_base = window.new_table();
        window.map_guest_page(table_base, GUEST_VA, 0x5_0000);
        window.map_guest_page(table_base, GUEST_VA + 0x2000, 0x2_1000);
        let mut context = MappingContext::new(window);

        assert_eq!(
            context.write_virtual(table_base, GUEST_VA + 0xff0, &[0x5a; 0x1020]),
            Err(HypervisorError::Unsuccessful)
        );

        let mut buffer = [0u8; 0x20];
        assert_eq!(
            context.read_virtual(table_base, GUEST_VA + 0xff0, &mut buffer),
            Err(HypervisorError::Unsuccessful)
        );
        assert_eq!(buffer[..0x10], [0x5au8; 0x10]);

        let mut window = context.into_window();
        assert_eq!(window.read_bytes(0x2_1000, 0x10), [0u8; 0x10]);
    }

    #[test]
    fn translate_walks_guest_tables() {
        let (mut context, table_base) = scattered_guest();

        assert_eq!(context.translate(table_base, GUEST_VA + 0x1234), Some(0x9_3234));
        assert_eq!(context.translate(table_base, GUEST_VA + 0x3000), None);
        assert_eq!(context.translate(table_base, GUEST_VA + 0x4000_0000), None);
        assert_eq!(context.translate(table_base, 0xffff_8000_0000_0000), None);

        let mut window = context.into_window();
        window.map_guest_large_page(table_base, 0x4000_0000, 0x1_0020_0000);
        let mut context = MappingContext::new(window);
        assert_eq!(context.translate(table_base, 0x401f_fff0), Some(0x1_003f_fff0));
    }

    #[test]
    fn virtual_access_reaches_top_of_address_space() {
        let mut window = SimulatedWindow::new();
        let table_base = window.new_table();
        window.map_guest_page(table_base, 0xffff_ffff_ffff_f000, 0x7_7000);
        let mut context = MappingContext::new(window);

        let data: alloc::vec::Vec<u8> = (0..0x100u32).map(|i| i as u8).collect();
        context.write_virtual(table_base, 0xffff_ffff_ffff_ff00, &data).unwrap();

        let mut read_back = [0u8; 0x100];
        context.read_virtual(table_base, 0xffff_ffff_ffff_ff00, &mut read_back).unwrap();
        assert_eq!(read_back[..], data[..]);

        let mut window = context.into_window();
        assert_eq!(window.read_bytes(0x7_7f00, 0x100), data);
    }

    #[test]
    fn spans_respect_page_boundaries() {
        let spans: alloc::vec::Vec<_> = page_spans(0x1f00, 0x2100).collect();
        assert_eq!(spans, [(0x1f00, 0..0x100), (0x2000, 0x100..0x1100), (0x3000, 0x1100..0x2100)]);

        let spans: alloc::vec::Vec<_> = page_spans(0x3000, 0x1000).collect();
        assert_eq!(spans, [(0x3000, 0..0x1000)]);

        assert_eq!(page_spans(0x3000, 0).count(), 0);

        let spans: alloc::vec::Vec<_> = page_spans(0xffff_ffff_ffff_fff0, 0x20).collect();
        assert_eq!(spans, [(0xffff_ffff_ffff_fff0, 0..0x10), (0, 0x10..0x20)]);

        assert_eq!(chunk_length(0x1ffc, 0x10), 4);
        assert_eq!(chunk_length(0x2000, 0x10), 0x10);
    }
}
