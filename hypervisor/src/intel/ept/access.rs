//! Access rights that can be granted to guest-physical memory through the EPT.

use crate::intel::ept::paging::Entry;

// Constants defining sizes for the regions covered by EPT entries.
pub const _512GB: u64 = 512 * 1024 * 1024 * 1024;
pub const _2MB: u64 = 2 * 1024 * 1024;

bitflags::bitflags! {
    /// Represents the different access permissions for an EPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        /// The EPT entry allows read access.
        const READ = 0b001;
        /// The EPT entry allows write access.
        const WRITE = 0b010;
        /// The EPT entry allows execute access.
        const EXECUTE = 0b100;
        /// The EPT entry allows read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// The EPT entry allows read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// The EPT entry allows read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl AccessType {
    /// The access rights currently granted by `entry`.
    pub fn of(entry: &Entry) -> Self {
        Self::from_bits_truncate((entry.raw() & 0b111) as u8)
    }

    /// Rewrites the read/write/execute bits of `entry`, leaving every other field intact.
    pub fn apply(self, entry: &mut Entry) {
        entry.set_readable(self.contains(Self::READ));
        entry.set_writable(self.contains(Self::WRITE));
        entry.set_executable(self.contains(Self::EXECUTE));
    }
}
