// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cache-line-aligned raw allocation.
//!
//! Everything the scheduler shares between threads (task slabs, scheduler
//! objects) is allocated on its own cache line so that unrelated objects
//! never exhibit false sharing. Callers that depend on zeroed storage must
//! zero it themselves; the returned bytes may hold any value.

use crate::error::AllocFailed;
use core::alloc::Layout;
use core::ptr::NonNull;

pub(crate) use util::CACHE_LINE_SIZE;

/// Rounds `layout` up to cache-line alignment.
#[inline]
pub(crate) fn cache_aligned(layout: Layout) -> Layout {
    // Layout::align_to only fails when the alignment is not a power of two.
    layout
        .align_to(CACHE_LINE_SIZE)
        .expect("cache line size is a power of two")
        .pad_to_align()
}

/// Allocates `layout.size()` bytes aligned to at least the cache line size.
///
/// # Errors
///
/// Returns [`AllocFailed`] when the global allocator returns null.
pub(crate) fn allocate(layout: Layout) -> Result<NonNull<u8>, AllocFailed> {
    let layout = cache_aligned(layout);
    debug_assert!(layout.size() > 0);
    // Safety: the layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or(AllocFailed(()))
}

/// Releases storage obtained from [`allocate`] with the same `layout`.
///
/// # Safety
///
/// `ptr` must have been returned by [`allocate`] with an equal `layout`, and
/// must not be used afterwards.
pub(crate) unsafe fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    let layout = cache_aligned(layout);
    // Safety: ensured by caller
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_at_least_a_cache_line() {
        let layout = Layout::from_size_align(24, 8).unwrap();
        let ptr = allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        // Safety: just allocated with the same layout.
        unsafe { deallocate(ptr, layout) }
    }
}
