pub mod addresses;
pub mod alloc;
pub mod debug;
pub mod instructions;
pub mod logger;
#[cfg(feature = "nt")]
pub mod nt;
