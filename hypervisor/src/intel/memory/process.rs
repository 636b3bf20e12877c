//! Locating the page tables of a guest process from its kernel process object.
//!
//! CR3 cannot be used directly: with kernel virtual address shadowing the guest runs on a shadow
//! hierarchy. The process object records both the kernel and the user directory table base.

/// Offsets of the directory table bases inside the process object.
///
/// These depend on the exact OS build and must be supplied by whoever knows the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOffsets {
    /// Kernel directory table base (`KPROCESS.DirectoryTableBase`).
    pub directory_table_base: usize,
    /// User directory table base (`KPROCESS.UserDirectoryTableBase`).
    pub user_directory_table_base: usize,
}

impl Default for ProcessOffsets {
    /// Windows 10 x64.
    fn default() -> Self {
        Self {
            directory_table_base: 0x28,
            user_directory_table_base: 0x388,
        }
    }
}

/// Flags in the low 12 bits of a table base (PCID and friends).
const TABLE_BASE_FLAGS: u64 = 0xfff;

/// Returns the page-table root to use for the user address space of `process`.
///
/// The user directory table base is preferred. When it is unset (no shadowing, e.g. elevated
/// processes) the kernel directory table base is used instead.
///
/// # Safety
///
/// `process` must point to a live process object laid out as `offsets` describes.
pub unsafe fn resolve_table_base(process: *const u8, offsets: &ProcessOffsets) -> u64 {
    let read = |offset: usize| {
        core::ptr::read_unaligned(process.add(offset) as *const u64) & !TABLE_BASE_FLAGS
    };

    match read(offsets.user_directory_table_base) {
        0 => read(offsets.directory_table_base),
        user => user,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec};

    fn process(kernel: u64, user: u64) -> alloc::vec::Vec<u8> {
        let offsets = ProcessOffsets::default();
        let mut object = vec![0u8; 0x400];
        object[offsets.directory_table_base..][..8].copy_from_slice(&kernel.to_le_bytes());
        object[offsets.user_directory_table_base..][..8].copy_from_slice(&user.to_le_bytes());
        object
    }

    #[test]
    fn prefers_user_table_base() {
        let object = process(0x1ad000, 0x3c5_0002);
        let base = unsafe { resolve_table_base(object.as_ptr(), &ProcessOffsets::default()) };
        assert_eq!(base, 0x3c5_0000);
    }

    #[test]
    fn falls_back_to_kernel_table_base() {
        // A user table base of 1 carries flags only.
        let object = process(0x1ad002, 0x1);
        let base = unsafe { resolve_table_base(object.as_ptr(), &ProcessOffsets::default()) };
        assert_eq!(base, 0x1ad000);
    }
}
