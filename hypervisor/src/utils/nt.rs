//! Windows kernel backends.

use {
    crate::{
        error::HypervisorError,
        intel::memory::{reserved::ReservedPage, MappingWindow},
        utils::addresses::AddressTranslation,
    },
    wdk_sys::{
        ntddk::{
            MmAllocateMappingAddress, MmFreeMappingAddress, MmGetPhysicalAddress,
            MmGetVirtualForPhysical,
        },
        PHYSICAL_ADDRESS,
    },
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// Pool tag of the reserved mapping page ('EptM').
pub const POOL_TAG: u32 = u32::from_le_bytes(*b"EptM");

/// Address translation through the memory manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct NtTranslation;

impl AddressTranslation for NtTranslation {
    fn pa_from_va(&self, va: u64) -> u64 {
        unsafe { MmGetPhysicalAddress(va as _).QuadPart as u64 }
    }

    fn va_from_pa(&self, pa: u64) -> Option<u64> {
        let mut physical_address: PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        physical_address.QuadPart = pa as i64;

        let va = unsafe { MmGetVirtualForPhysical(physical_address) } as u64;
        (va != 0).then_some(va)
    }
}

/// A mapping window reserved with `MmAllocateMappingAddress`, released when dropped.
pub struct NtMappingPage {
    page: ReservedPage,
}

impl NtMappingPage {
    /// Reserves one page of system address space and takes over its PTE.
    ///
    /// Must be called at PASSIVE_LEVEL, before the processor is virtualized.
    pub fn new(host_cr3: u64) -> Result<Self, HypervisorError> {
        let va = unsafe { MmAllocateMappingAddress(BASE_PAGE_SIZE as _, POOL_TAG) };
        if va.is_null() {
            log::error!("Failed to reserve the mapping page");
            return Err(HypervisorError::NoMemory);
        }

        match unsafe { ReservedPage::new(host_cr3, va as u64, &NtTranslation) } {
            Ok(page) => Ok(Self { page }),
            Err(error) => {
                unsafe { MmFreeMappingAddress(va, POOL_TAG) };
                Err(error)
            }
        }
    }
}

impl MappingWindow for NtMappingPage {
    fn install(&mut self, pfn: u64) {
        self.page.install(pfn);
    }

    fn clear(&mut self) {
        self.page.clear();
    }

    fn base(&mut self) -> *mut u8 {
        self.page.base()
    }

    fn mapped_pfn(&self) -> Option<u64> {
        self.page.mapped_pfn()
    }
}

impl Drop for NtMappingPage {
    fn drop(&mut self) {
        if self.page.mapped_pfn().is_some() {
            self.page.clear();
        }

        unsafe { MmFreeMappingAddress(self.page.va() as _, POOL_TAG) };
    }
}
