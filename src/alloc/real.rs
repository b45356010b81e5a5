//! The functions we wrap. With `ld-wrap`, these are the originals the linker
//! renamed to `__real_<sym>` when the program was linked with
//! `-Wl,--wrap=<sym>`. Without it, they are just libc.

#[cfg(feature = "ld-wrap")]
mod sys {
    use libc::{c_char, c_int, c_void, size_t};

    extern "C" {
        #[link_name = "__real_malloc"]
        pub(crate) fn malloc(_: size_t) -> *mut c_void;
        #[link_name = "__real_free"]
        pub(crate) fn free(_: *mut c_void);
        #[link_name = "__real_calloc"]
        pub(crate) fn calloc(_: size_t, _: size_t) -> *mut c_void;
        #[link_name = "__real_realloc"]
        pub(crate) fn realloc(_: *mut c_void, _: size_t) -> *mut c_void;
        #[link_name = "__real_valloc"]
        pub(crate) fn valloc(_: size_t) -> *mut c_void;
        #[link_name = "__real_aligned_alloc"]
        pub(crate) fn aligned_alloc(_: size_t, _: size_t) -> *mut c_void;

        #[link_name = "__real_memcpy"]
        pub(crate) fn memcpy(_: *mut c_void, _: *const c_void, _: size_t) -> *mut c_void;
        #[link_name = "__real_memmove"]
        pub(crate) fn memmove(_: *mut c_void, _: *const c_void, _: size_t) -> *mut c_void;
        #[link_name = "__real_memset"]
        pub(crate) fn memset(_: *mut c_void, _: c_int, _: size_t) -> *mut c_void;
        #[link_name = "__real_strcpy"]
        pub(crate) fn strcpy(_: *mut c_char, _: *const c_char) -> *mut c_char;
        #[link_name = "__real_strcat"]
        pub(crate) fn strcat(_: *mut c_char, _: *const c_char) -> *mut c_char;
        #[link_name = "__real_strncpy"]
        pub(crate) fn strncpy(_: *mut c_char, _: *const c_char, _: size_t) -> *mut c_char;
        #[link_name = "__real_strncat"]
        pub(crate) fn strncat(_: *mut c_char, _: *const c_char, _: size_t) -> *mut c_char;
    }
}

#[cfg(not(feature = "ld-wrap"))]
mod sys {
    use libc::{c_void, size_t};
    pub(crate) use libc::{
        calloc, free, malloc, memcpy, memmove, memset, realloc, strcat, strcpy, strncat, strncpy,
    };

    extern "C" {
        pub(crate) fn valloc(_: size_t) -> *mut c_void;
        pub(crate) fn aligned_alloc(_: size_t, _: size_t) -> *mut c_void;
    }
}

pub(crate) use sys::*;

/// `malloc_usable_size()` never gets wrapped, so it always comes from libc
pub(crate) use libc::malloc_usable_size;
