//! The C surface: compiler instrumentation hooks and the `__wrap_<sym>`
//! replacements for the allocator and the string functions.
//!
//! Everything goes through one process-wide [`Sanitizer`] configured from the
//! environment (see [`Config::from_env()`]). If that configuration is missing
//! or broken, every entry point passes straight through to the real function.

use std::cell::Cell;

use libc::{c_char, c_int, c_void, size_t};
use log::warn;

use crate::{
    alloc::{real, HeapAllocator, LibcHeap},
    config::Config,
    lazy_lock::{LazyLock, LazyLockState},
    os::mem::MmapPages,
    report::FaultKind,
    sanitizer::Sanitizer,
};

type GlobalSanitizer = Sanitizer<LibcHeap, MmapPages>;

static HSAN: LazyLock<Option<GlobalSanitizer>> = LazyLock::new(init_global);

fn init_global() -> Option<GlobalSanitizer> {
    _ = env_logger::try_init();
    match Config::from_env().and_then(|config| Sanitizer::new(&config, LibcHeap, MmapPages)) {
        Ok(san) => Some(san),
        Err(e) => {
            warn!("hsan disabled, passing every call through: {e}");
            None
        }
    }
}

thread_local! {
    /// Set while this thread is inside one of our entry points. Anything we
    /// call that comes back in (the logger, the reporter, our own
    /// allocations) goes straight to the real function.
    static IN_SANITIZER: Cell<bool> = const { Cell::new(false) };
}

struct ReentryGuard(());

impl ReentryGuard {
    /// `None` if this thread is already inside, or its thread-locals are gone
    fn enter() -> Option<Self> {
        IN_SANITIZER
            .try_with(|inside| (!inside.replace(true)).then_some(ReentryGuard(())))
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        _ = IN_SANITIZER.try_with(|inside| inside.set(false));
    }
}

/// Run `f` on the global sanitizer, initializing it if needed, or `bypass` if
/// we are re-entering or the sanitizer is disabled
#[inline]
fn with_sanitizer<R>(bypass: impl FnOnce() -> R, f: impl FnOnce(&GlobalSanitizer) -> R) -> R {
    let Some(_entered) = ReentryGuard::enter() else {
        return bypass();
    };
    match LazyLock::force(&HSAN) {
        Some(san) => f(san),
        None => bypass(),
    }
}

/// [`with_sanitizer()`], but never initializes: before the first allocation
/// nothing is tagged, so there is nothing to check
#[inline]
fn with_active<R>(bypass: impl FnOnce() -> R, f: impl FnOnce(&GlobalSanitizer) -> R) -> R {
    if LazyLock::state(&HSAN) != LazyLockState::Init {
        return bypass();
    }
    with_sanitizer(bypass, f)
}

fn check_access(addr: usize, size: usize, kind: FaultKind) {
    with_active(
        || (),
        |san| {
            // Reported already; the access goes ahead either way
            _ = match kind {
                FaultKind::Load => san.validate_load(addr, size),
                _ => san.validate_store(addr, size),
            };
        },
    )
}

macro_rules! access_hooks {
    ($($load:ident, $store:ident => $size:literal;)*) => {$(
        #[no_mangle]
        pub extern "C" fn $load(addr: usize) {
            check_access(addr, $size, FaultKind::Load)
        }

        #[no_mangle]
        pub extern "C" fn $store(addr: usize) {
            check_access(addr, $size, FaultKind::Store)
        }
    )*};
}

access_hooks! {
    __asan_load1_noabort, __asan_store1_noabort => 1;
    __asan_load2_noabort, __asan_store2_noabort => 2;
    __asan_load4_noabort, __asan_store4_noabort => 4;
    __asan_load8_noabort, __asan_store8_noabort => 8;
    __asan_load16_noabort, __asan_store16_noabort => 16;
}

#[no_mangle]
pub extern "C" fn __asan_loadN_noabort(addr: usize, size: size_t) {
    check_access(addr, size, FaultKind::Load)
}

#[no_mangle]
pub extern "C" fn __asan_storeN_noabort(addr: usize, size: size_t) {
    check_access(addr, size, FaultKind::Store)
}

#[no_mangle]
pub extern "C" fn __asan_handle_no_return() {}

#[no_mangle]
pub extern "C" fn __wrap_malloc(size: size_t) -> *mut c_void {
    with_sanitizer(|| LibcHeap.malloc(size), |san| san.malloc(size)) as _
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_free(ptr: *mut c_void) {
    with_sanitizer(
        || unsafe { LibcHeap.free(ptr as _) },
        |san| {
            // Refused frees are reported, and the block is deliberately leaked
            _ = unsafe { san.free(ptr as _) };
        },
    )
}

#[no_mangle]
pub extern "C" fn __wrap_calloc(count: size_t, size: size_t) -> *mut c_void {
    with_sanitizer(
        || LibcHeap.calloc(count, size),
        |san| san.calloc(count, size),
    ) as _
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    with_sanitizer(
        || unsafe { LibcHeap.realloc(ptr as _, size) },
        |san| unsafe { san.realloc(ptr as _, size) },
    ) as _
}

#[no_mangle]
pub extern "C" fn __wrap_valloc(size: size_t) -> *mut c_void {
    with_sanitizer(|| LibcHeap.valloc(size), |san| san.valloc(size)) as _
}

#[no_mangle]
pub extern "C" fn __wrap_aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    with_sanitizer(
        || LibcHeap.aligned_alloc(align, size),
        |san| san.aligned_alloc(align, size),
    ) as _
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_memcpy(dest: *mut c_void, src: *const c_void, n: size_t) -> *mut c_void {
    with_active(
        || unsafe { real::memcpy(dest, src, n) },
        |san| unsafe { san.memcpy(dest as _, src as _, n) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_memmove(dest: *mut c_void, src: *const c_void, n: size_t) -> *mut c_void {
    with_active(
        || unsafe { real::memmove(dest, src, n) },
        |san| unsafe { san.memmove(dest as _, src as _, n) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_memset(dest: *mut c_void, c: c_int, n: size_t) -> *mut c_void {
    with_active(
        || unsafe { real::memset(dest, c, n) },
        |san| unsafe { san.memset(dest as _, c, n) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_strcpy(dest: *mut c_char, src: *const c_char) -> *mut c_char {
    with_active(
        || unsafe { real::strcpy(dest, src) },
        |san| unsafe { san.strcpy(dest as _, src as _) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_strcat(dest: *mut c_char, src: *const c_char) -> *mut c_char {
    with_active(
        || unsafe { real::strcat(dest, src) },
        |san| unsafe { san.strcat(dest as _, src as _) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_strncpy(dest: *mut c_char, src: *const c_char, n: size_t) -> *mut c_char {
    with_active(
        || unsafe { real::strncpy(dest, src, n) },
        |san| unsafe { san.strncpy(dest as _, src as _, n) as _ },
    )
}

#[no_mangle]
pub unsafe extern "C" fn __wrap_strncat(dest: *mut c_char, src: *const c_char, n: size_t) -> *mut c_char {
    with_active(
        || unsafe { real::strncat(dest, src, n) },
        |san| unsafe { san.strncat(dest as _, src as _, n) as _ },
    )
}

/// Mark `start..end` as a redzone. Returns 1 if anything was marked.
#[no_mangle]
pub extern "C" fn hsan_protect(start: usize, end: usize) -> c_int {
    with_active(|| 0, |san| san.protect(start, end) as c_int)
}

/// Mark `start..end` accessible again. Returns 1 if anything was marked.
#[no_mangle]
pub extern "C" fn hsan_unprotect(start: usize, end: usize) -> c_int {
    with_active(|| 0, |san| san.unprotect(start, end) as c_int)
}

#[no_mangle]
pub extern "C" fn hsan_faults_reported() -> size_t {
    with_active(|| 0, |san| san.faults_reported())
}

#[no_mangle]
pub extern "C" fn hsan_log_regions() {
    with_active(|| (), |san| san.log_regions())
}
