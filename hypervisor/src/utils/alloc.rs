//! Fallible allocation of page-aligned paging structures.

use {
    alloc::boxed::Box,
    core::alloc::Layout,
};

/// Marker for types made only of integer fields, for which the all-zero bit pattern is a valid
/// value.
///
/// # Safety
///
/// Implementors must be valid when every byte is zero.
pub unsafe trait Zeroable: Sized {}

/// Allocates a zero-filled `T` on the heap, returning `None` instead of aborting when the
/// allocator is out of memory.
///
/// Paging structures are far too large to be built on the stack first (the EPT directories alone
/// are 2MB), so they are zeroed in place.
pub fn try_zeroed_box<T: Zeroable>() -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    debug_assert!(layout.size() != 0);

    // SAFETY: the layout is non-empty and the zero bit pattern is a valid `T`.
    let memory = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut T;

    if memory.is_null() {
        log::error!("Failed to allocate {:#x} bytes", layout.size());
        None
    } else {
        Some(unsafe { Box::from_raw(memory) })
    }
}
