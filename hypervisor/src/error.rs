use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Failed to allocate memory for a handler record or page table")]
    NoMemory,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Address is outside the range covered by the EPT")]
    InvalidAddress,
    #[error("Large page is already split")]
    AlreadyComplete,
    #[error("Guest memory translation or transfer failed")]
    Unsuccessful,
    #[error("EPT PML4 base address is not 4KB aligned")]
    InvalidEptPml4BaseAddress,
    #[error("Reserved page is not backed by a page table entry or a 2MB page directory entry")]
    UnsupportedHostMapping,
}
