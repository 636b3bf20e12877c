pub mod ept;
pub mod invept;
pub mod memory;
pub mod paging;
pub mod support;
pub mod vmerror;
pub mod vmexit;
