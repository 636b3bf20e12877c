//! Second-level address translation for a VT-x hypervisor.
//!
//! - [`intel::ept`] builds and edits the Extended Page Tables of a virtual machine and dispatches
//!   EPT violations to registered handlers.
//! - [`intel::memory`] reads and writes guest physical and virtual memory from VMX root through a
//!   per-processor mapping window.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod intel;
pub mod utils;

pub use {
    error::HypervisorError,
    intel::{
        ept::{access::AccessType, mtrr::MtrrRange, EptConfig},
        memory::{process::ProcessOffsets, MappingContext, MappingWindow},
        vmexit::GuestState,
    },
};
