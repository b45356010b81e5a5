use std::ffi::c_void;

use super::real;

/// The allocator whose blocks we are watching. All sizing, alignment and
/// zeroing semantics are the allocator's; we only need to know how large a
/// block really is.
///
/// # Safety
/// - [`HeapAllocator::usable_size()`] must return at least the size that was
///   asked for, and every byte it reports must belong to the block
/// - Blocks must be preceded by at least [`crate::shadow::OVERHEAD`] bytes that
///   the program never touches (the allocator's chunk header)
pub unsafe trait HeapAllocator: Send + Sync {
    /// `NULL` on failure
    fn malloc(&self, size: usize) -> *mut u8;

    /// # Safety
    /// - `ptr` must be a live block from this allocator
    unsafe fn free(&self, ptr: *mut u8);

    /// # Safety
    /// - `ptr` must be `NULL` or a live block from this allocator
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;

    fn calloc(&self, count: usize, size: usize) -> *mut u8;

    /// Page-aligned `malloc()`
    fn valloc(&self, size: usize) -> *mut u8;

    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8;

    /// # Safety
    /// - `ptr` must be a live block from this allocator
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
}

/// The process allocator: libc, or the `__real_` symbols with `ld-wrap`
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

unsafe impl HeapAllocator for LibcHeap {
    fn malloc(&self, size: usize) -> *mut u8 {
        unsafe { real::malloc(size) as *mut u8 }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        unsafe { real::free(ptr as *mut c_void) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { real::realloc(ptr as *mut c_void, size) as *mut u8 }
    }

    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        unsafe { real::calloc(count, size) as *mut u8 }
    }

    fn valloc(&self, size: usize) -> *mut u8 {
        unsafe { real::valloc(size) as *mut u8 }
    }

    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        unsafe { real::aligned_alloc(align, size) as *mut u8 }
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe { real::malloc_usable_size(ptr as *mut c_void) }
    }
}
