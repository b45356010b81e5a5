//! Test doubles: a private heap arena, a bump allocator over it, a page source
//! that remembers what it was asked for, and a sink that keeps the text.

use std::{
    fmt::{self, Write},
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use crate::{
    alloc::HeapAllocator,
    config::{Config, OnFault},
    error::ShadowError,
    os::mem::{errno, MmapPages, PageSource, PAGE_SIZE},
    report::{FaultReport, ReportSink},
    sanitizer::Sanitizer,
    shadow::{ShadowLayout, OVERHEAD},
    util::{
        hint::cold,
        num::{align_up, round_up},
    },
};

/// An owned, page-aligned, read/write anonymous mapping. Unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory, we only hand out its address
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned arena of at least `size` bytes
    /// (rounded up to whole pages) without reserving swap for it.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion, ShadowError> {
        if size == 0 {
            return Err(ShadowError::MapFailed {
                addr: 0,
                size,
                errno: libc::EINVAL,
            });
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: a fresh mapping at a kernel-chosen address can't clobber
        // anything
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // super duper unlikely
            return cold(|| {
                Err(ShadowError::MapFailed {
                    addr: 0,
                    size,
                    errno: errno(),
                })
            });
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(ShadowError::MapFailed {
            addr: 0,
            size,
            errno: libc::EINVAL,
        })?;
        Ok(MmapRegion { ptr, size })
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size, which it is,
        //   because we only construct this from an `mmap()` result
        // - We unmap exactly the `self.size` bytes we were given. Pages that
        //   were later re-mapped with `MAP_FIXED` inside it go too.
        unsafe {
            munmap(self.ptr.as_ptr() as _, self.size);
        }
    }
}

/// 16MiB of heap plus room for its shadow
pub const ARENA_SIZE: usize = 0x110_0000;

/// A heap-sized anonymous mapping we can point a sanitizer at
pub struct TestArena {
    region: MmapRegion,
    layout: ShadowLayout,
}

impl TestArena {
    pub fn new() -> Self {
        let region = MmapRegion::map_noreserve(ARENA_SIZE).unwrap();
        let layout = ShadowLayout::new(region.addr(), region.size(), *PAGE_SIZE).unwrap();
        Self { region, layout }
    }

    pub fn layout(&self) -> &ShadowLayout {
        &self.layout
    }

    pub fn heap_base(&self) -> usize {
        self.layout.heap_base()
    }

    pub fn config(&self) -> Config {
        Config::new(self.region.addr(), self.region.size())
    }
}

/// Never reuses memory, so every block stays where it was for the whole test.
/// Each block has an [`OVERHEAD`]-byte header whose last word is the usable
/// size.
pub struct BumpHeap {
    next: Mutex<usize>,
    end: usize,
    frees: AtomicUsize,
}

impl BumpHeap {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            next: Mutex::new(start),
            end,
            frees: AtomicUsize::new(0),
        }
    }

    /// A heap with no room at all
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// How many times `free()` was called
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    fn carve(&self, align: usize, size: usize) -> *mut u8 {
        let usable = round_up(size.max(1), OVERHEAD);
        let mut next = self.next.lock().unwrap();
        let ptr = align_up(*next + OVERHEAD, align.max(OVERHEAD));
        if ptr + usable > self.end {
            return ptr::null_mut();
        }
        *next = ptr + usable;
        unsafe { ((ptr - std::mem::size_of::<usize>()) as *mut usize).write(usable) };
        ptr as *mut u8
    }
}

unsafe impl HeapAllocator for BumpHeap {
    fn malloc(&self, size: usize) -> *mut u8 {
        self.carve(OVERHEAD, size)
    }

    unsafe fn free(&self, _ptr: *mut u8) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        let new = self.malloc(size);
        if !ptr.is_null() && !new.is_null() {
            let old = unsafe { self.usable_size(ptr) };
            unsafe { ptr::copy_nonoverlapping(ptr, new, old.min(size)) };
        }
        new
    }

    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let total = count.checked_mul(size).unwrap();
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe { ptr.write_bytes(0, total) };
        }
        ptr
    }

    fn valloc(&self, size: usize) -> *mut u8 {
        self.carve(*PAGE_SIZE, size)
    }

    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        self.carve(align, size)
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe { (ptr.sub(std::mem::size_of::<usize>()) as *const usize).read() }
    }
}

/// Forwards to [`MmapPages`] and keeps every `(addr, size)` it was asked for
pub struct RecordingPages {
    region: Option<MmapRegion>,
    requests: Mutex<Vec<(usize, usize)>>,
    fail: bool,
}

impl RecordingPages {
    /// Pages backed by a private mapping of `size` bytes; see [`Self::base()`]
    pub fn new(size: usize) -> Self {
        Self {
            region: Some(MmapRegion::map_noreserve(size).unwrap()),
            requests: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// For callers that bring their own address range (a [`TestArena`])
    pub fn unbacked() -> Self {
        Self {
            region: None,
            requests: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Refuse every request with `ENOMEM`
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn base(&self) -> usize {
        self.region.as_ref().unwrap().addr()
    }

    pub fn requests(&self) -> Vec<(usize, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

unsafe impl PageSource for RecordingPages {
    unsafe fn reserve_pages(&self, addr: usize, size: usize) -> Result<NonNull<u8>, ShadowError> {
        self.requests.lock().unwrap().push((addr, size));
        if self.fail {
            return Err(ShadowError::MapFailed {
                addr,
                size,
                errno: libc::ENOMEM,
            });
        }
        unsafe { MmapPages.reserve_pages(addr, size) }
    }
}

/// Keeps report text as `E <line>` / `I <line>` lines
pub struct CaptureSink {
    text: Arc<Mutex<String>>,
    faults: AtomicUsize,
}

impl CaptureSink {
    pub fn new(text: Arc<Mutex<String>>) -> Self {
        Self {
            text,
            faults: AtomicUsize::new(0),
        }
    }

    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }
}

impl ReportSink for CaptureSink {
    fn error(&self, args: fmt::Arguments<'_>) {
        _ = writeln!(self.text.lock().unwrap(), "E {args}");
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        _ = writeln!(self.text.lock().unwrap(), "I {args}");
    }

    fn fault(&self, _report: &FaultReport) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }
}

/// A sanitizer over `arena` with a fresh [`BumpHeap`], capturing its reports.
/// Faults never crash and never print backtraces; `configure` can change the
/// rest.
pub fn sanitizer<F>(arena: &TestArena, configure: F) -> (Sanitizer<BumpHeap, RecordingPages>, Arc<Mutex<String>>)
where
    F: FnOnce(Config) -> Config,
{
    _ = env_logger::builder().is_test(true).try_init();
    let config = configure(arena.config().on_fault(OnFault::Continue).backtrace(false));
    let text = Arc::new(Mutex::new(String::new()));
    let heap = BumpHeap::new(arena.heap_base(), arena.layout().heap_end());
    let san = Sanitizer::with_sink(
        &config,
        heap,
        RecordingPages::unbacked(),
        Box::new(CaptureSink::new(text.clone())),
    )
    .unwrap();
    (san, text)
}
