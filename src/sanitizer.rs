//! The sanitizer proper: allocation tagging, free interception, access
//! validation and fault reporting over one tracked heap.

use std::{
    ffi::{c_char, c_int, c_void},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, info, trace, warn};

use crate::{
    alloc::{real, HeapAllocator},
    arch::mem::{strnlen_maybe_garbage, u8_load_acq},
    config::{Config, SinkKind},
    error::{ConfigError, FreeError, ShadowError},
    guard::Guard,
    os::mem::{PageSource, PAGE_SIZE},
    report::{self, AnsiSink, FaultKind, FaultReport, JsonSink, LogSink, ReportSink},
    shadow::{ShadowLayout, ShadowMap, ShadowRegion, ShadowValue, OVERHEAD, RZ_SIZE},
    util::num::{align_down, align_up},
};

pub struct Sanitizer<H, P> {
    layout: ShadowLayout,
    shadow: Guard<ShadowMap>,
    heap: H,
    pages: P,
    config: Config,
    sink: Box<dyn ReportSink>,
    faults: AtomicUsize,
}

/// Paint a freshly allocated block: pre-redzone, body, post-redzone
fn paint_block<P>(
    map: &mut ShadowMap,
    pages: &P,
    addr: usize,
    size: usize,
    usable: usize,
) -> Result<(), ShadowError>
where
    P: PageSource + ?Sized,
{
    let start = addr.saturating_sub(OVERHEAD);
    let body_end = addr + align_up(size, RZ_SIZE);
    let end = addr + usable + OVERHEAD;

    map.ensure_mapped(pages, start, end)?;
    map.paint(start, addr, ShadowValue::Redzone)?;
    map.paint(addr, body_end, ShadowValue::Accessible)?;
    map.paint(body_end, end, ShadowValue::Redzone)
}

/// The shadow of `start..end` as `(start, end, value)` runs of equal cells
fn shadow_runs(map: &ShadowMap, start: usize, end: usize) -> Vec<(usize, usize, ShadowValue)> {
    let mut runs: Vec<(usize, usize, ShadowValue)> = Vec::new();
    let mut cell = start;
    while cell < end {
        let next = (align_down(cell, RZ_SIZE) + RZ_SIZE).min(end);
        let value = map.value_at(cell);
        match runs.last_mut() {
            Some((_, run_end, run_value)) if *run_value == value => *run_end = next,
            _ => runs.push((cell, next, value)),
        }
        cell = next;
    }
    runs
}

impl<H, P> Sanitizer<H, P>
where
    H: HeapAllocator,
    P: PageSource,
{
    /// Build a sanitizer reporting to the sink `config` asks for
    pub fn new(config: &Config, heap: H, pages: P) -> Result<Self, ConfigError> {
        let sink: Box<dyn ReportSink> = match config.sink {
            SinkKind::Ansi => Box::new(AnsiSink),
            SinkKind::Log => Box::new(LogSink),
            SinkKind::Json => Box::new(JsonSink),
        };
        Self::with_sink(config, heap, pages, sink)
    }

    pub fn with_sink(
        config: &Config,
        heap: H,
        pages: P,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, ConfigError> {
        let layout = ShadowLayout::new(config.heap_base, config.heap_size, *PAGE_SIZE)?;
        info!(
            "tracking heap {:#x}..{:#x}, shadow at {:#x}..{:#x}",
            layout.heap_base(),
            layout.heap_end(),
            layout.shadow_base(),
            layout.shadow_end()
        );
        Ok(Self {
            layout,
            shadow: Guard::new(ShadowMap::new(layout)),
            heap,
            pages,
            config: config.clone(),
            sink,
            faults: AtomicUsize::new(0),
        })
    }

    pub fn layout(&self) -> &ShadowLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }

    /// How many faults have been reported so far
    pub fn faults_reported(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        let ptr = self.heap.malloc(size);
        // SAFETY: fresh block from our heap
        unsafe { self.tag(ptr, size) }
    }

    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            warn!("calloc({count}, {size}) overflows");
            return ptr::null_mut();
        };
        let ptr = self.heap.calloc(count, size);
        // SAFETY: fresh block from our heap
        unsafe { self.tag(ptr, total) }
    }

    pub fn valloc(&self, size: usize) -> *mut u8 {
        let ptr = self.heap.valloc(size);
        // SAFETY: fresh block from our heap
        unsafe { self.tag(ptr, size) }
    }

    pub fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        let ptr = self.heap.aligned_alloc(align, size);
        // SAFETY: fresh block from our heap
        unsafe { self.tag(ptr, size) }
    }

    /// `realloc()`, with the old block checked like a `free()`. A block that
    /// moves has its old body marked freed; one that can't be resized keeps
    /// its shadow.
    ///
    /// # Safety
    /// - `ptr` must be `NULL` or a block from this sanitizer's heap that the
    ///   caller owns
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            // Refusals are already reported
            _ = unsafe { self.free(ptr) };
            return ptr::null_mut();
        }

        let addr = ptr as usize;
        let mut shadow = self.shadow.lock();
        let before = shadow.addr_info(addr);
        if before.mapped && !before.value.is_accessible() {
            drop(shadow);
            self.report(addr, 1, Self::free_fault(before.value));
            return ptr::null_mut();
        }
        // SAFETY: the block is live as far as we can tell
        let old_usable = unsafe { self.heap.usable_size(ptr) };
        let saved = if before.mapped {
            let runs = shadow_runs(&shadow, addr, addr + old_usable);
            self.paint_or_warn(&mut shadow, addr, addr + old_usable, ShadowValue::AfterFree);
            runs
        } else {
            Vec::new()
        };
        drop(shadow);

        // SAFETY: the caller owns `ptr`
        let new = unsafe { self.heap.realloc(ptr, size) };
        if new.is_null() {
            // The old block is still live, body and slack as they were
            let mut shadow = self.shadow.lock();
            for (start, end, value) in saved {
                self.paint_or_warn(&mut shadow, start, end, value);
            }
            return new;
        }
        // SAFETY: fresh block from our heap
        unsafe { self.tag(new, size) }
    }

    /// Paint the envelope of `ptr`, a block of at least `size` bytes fresh out
    /// of the heap. Blocks outside the tracked heap, or whose shadow can't be
    /// backed, are handed back untagged.
    ///
    /// # Safety
    /// - `ptr` must be `NULL` or a live block from this sanitizer's heap
    pub unsafe fn tag(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return ptr;
        }
        let addr = ptr as usize;
        if !self.layout.contains(addr) {
            trace!("{addr:#x} is outside the tracked heap, not tagging");
            return ptr;
        }
        // SAFETY: the caller guarantees `ptr` is a live block
        let usable = unsafe { self.heap.usable_size(ptr) };

        let mut shadow = self.shadow.lock();
        if let Err(e) = paint_block(&mut shadow, &self.pages, addr, size, usable) {
            warn!("block {addr:#x} ({size} bytes) left untagged: {e}");
        }
        ptr
    }

    /// Check and poison `ptr`, then hand it to the real `free()`. Refused
    /// pointers are reported and never reach the allocator.
    ///
    /// # Safety
    /// - `ptr` must be `NULL` or a pointer the program believes it can free
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        if !self.layout.contains(addr) {
            // Never tagged, see `tag()`
            trace!("{addr:#x} is outside the tracked heap, freeing untouched");
            // SAFETY: the caller believes it owns `ptr`, and we have no say
            unsafe { self.heap.free(ptr) };
            return Ok(());
        }
        let mut shadow = self.shadow.lock();
        let info = shadow.addr_info(addr);

        if !info.mapped {
            drop(shadow);
            self.faults.fetch_add(1, Ordering::Relaxed);
            self.sink
                .error(format_args!("Error! Free an unallocated memory: [{addr:#x}]!"));
            return Err(FreeError::Unallocated { addr });
        }
        if !info.value.is_accessible() {
            drop(shadow);
            let report = self.report(addr, 1, Self::free_fault(info.value));
            return Err(FreeError::Rejected(report));
        }

        // Must be asked before the block goes back to the allocator
        // SAFETY: the shadow says this block is live
        let usable = unsafe { self.heap.usable_size(ptr) };
        self.paint_or_warn(&mut shadow, addr, addr + usable, ShadowValue::AfterFree);
        drop(shadow);

        // SAFETY: live block from our heap, and we've just made sure nobody
        // frees it twice through us
        unsafe { self.heap.free(ptr) };
        Ok(())
    }

    fn free_fault(value: ShadowValue) -> FaultKind {
        match value {
            ShadowValue::AfterFree => FaultKind::Free,
            _ => FaultKind::Unknown,
        }
    }

    fn paint_or_warn(&self, map: &mut ShadowMap, start: usize, end: usize, value: ShadowValue) {
        if let Err(e) = map.paint(start, end, value) {
            warn!("could not mark {start:#x}..{end:#x} as {value:?}: {e}");
        }
    }

    /// State of the cell holding `addr`. Untracked addresses are accessible.
    pub fn check_addr(&self, addr: usize) -> ShadowValue {
        self.shadow.lock().value_at(addr)
    }

    /// Is `addr..addr + size` accessible? Only the first and last byte are
    /// looked at, unless the sanitizer is strict.
    pub fn check_region(&self, addr: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let Some(last) = addr.checked_add(size - 1) else {
            return false;
        };
        let shadow = self.shadow.lock();
        if self.config.strict {
            // Every byte of a cell shares its state, so one byte per cell will do
            (addr & !(RZ_SIZE - 1)..=last)
                .step_by(RZ_SIZE)
                .all(|a| shadow.value_at(a).is_accessible())
        } else {
            shadow.value_at(addr).is_accessible() && shadow.value_at(last).is_accessible()
        }
    }

    pub fn validate_load(&self, addr: usize, size: usize) -> Result<(), FaultReport> {
        if !self.config.check_loads {
            return Ok(());
        }
        self.validate(addr, size, FaultKind::Load)
    }

    pub fn validate_store(&self, addr: usize, size: usize) -> Result<(), FaultReport> {
        if !self.config.check_stores {
            return Ok(());
        }
        self.validate(addr, size, FaultKind::Store)
    }

    fn validate(&self, addr: usize, size: usize, kind: FaultKind) -> Result<(), FaultReport> {
        let ok = match size {
            1 => self.check_addr(addr).is_accessible(),
            _ => self.check_region(addr, size),
        };
        if ok {
            Ok(())
        } else {
            Err(self.report(addr, size, kind))
        }
    }

    /// Check a `strcpy()` of `src` to `dest`, byte by byte, stopping at the
    /// first bad byte of either.
    ///
    /// # Safety
    /// - `src` must be NUL-terminated in mapped memory
    pub unsafe fn check_string_op(&self, dest: *const u8, src: *const u8) -> Result<(), FaultReport> {
        let (dest, src) = (dest as usize, src as usize);
        let failure = {
            let shadow = self.shadow.lock();
            let bad = |addr: usize| !shadow.value_at(addr).is_accessible();
            if bad(dest) {
                Some((dest, FaultKind::Store))
            } else if bad(src) {
                Some((src, FaultKind::Load))
            } else {
                let mut failure = None;
                let mut i = 0;
                // SAFETY: the caller guarantees `src` is NUL-terminated
                while unsafe { u8_load_acq((src + i) as *const u8) } != 0 {
                    if bad(dest + i + 1) {
                        failure = Some((dest + i + 1, FaultKind::Store));
                        break;
                    }
                    if bad(src + i + 1) {
                        failure = Some((src + i + 1, FaultKind::Load));
                        break;
                    }
                    i += 1;
                }
                failure
            }
        };
        match failure {
            Some((addr, kind)) => Err(self.report(addr, 1, kind)),
            None => Ok(()),
        }
    }

    /// Report a fault in `addr..addr + size` and apply the fault policy.
    /// Safe to call with the guard held by this thread; if another thread
    /// holds it, waits for it.
    pub fn report(&self, addr: usize, size: usize, kind: FaultKind) -> FaultReport {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let held = if self.shadow.is_held_by_current_thread() {
            None
        } else {
            Some(self.shadow.lock())
        };
        let map: &ShadowMap = match held.as_deref() {
            Some(map) => map,
            // SAFETY: the handle is ours, further up this thread's stack, and
            // nothing writes through it until we return
            None => unsafe { self.shadow.get_unguarded() },
        };
        // SAFETY: tracked heap bytes are mapped
        let report = unsafe { FaultReport::collect(map, addr, size, kind) };
        report.emit(&*self.sink);
        drop(held);

        report::conclude(self.config.on_fault, self.config.backtrace, &*self.sink);
        report
    }

    /// Mark `start..end` as a redzone by hand. Only ranges whose shadow is
    /// already backed can be protected. Returns whether anything was painted.
    pub fn protect(&self, start: usize, end: usize) -> bool {
        self.repaint_mapped(start, end, ShadowValue::Redzone)
    }

    /// Undo [`Self::protect()`], marking `start..end` accessible
    pub fn unprotect(&self, start: usize, end: usize) -> bool {
        self.repaint_mapped(start, end, ShadowValue::Accessible)
    }

    fn repaint_mapped(&self, start: usize, end: usize, value: ShadowValue) -> bool {
        if start >= end {
            return false;
        }
        let mut shadow = self.shadow.lock();
        if !shadow.is_range_mapped(start, end) {
            debug!("{start:#x}..{end:#x} has no shadow, not marking it {value:?}");
            return false;
        }
        shadow.paint(start, end, value).is_ok()
    }

    /// The backed shadow regions, lowest first
    pub fn regions(&self) -> Vec<ShadowRegion> {
        self.shadow.lock().regions().snapshot()
    }

    pub fn log_regions(&self) {
        let regions = self.regions();
        debug!("{} shadow region(s)", regions.len());
        for region in regions {
            debug!("  {:#x}..{:#x} ({:#x} bytes)", region.start, region.end(), region.size);
        }
    }

    /// # Safety
    /// Same as `memcpy()`
    pub unsafe fn memcpy(&self, dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        _ = self.validate_load(src as usize, n);
        _ = self.validate_store(dest as usize, n);
        unsafe { real::memcpy(dest as *mut c_void, src as *const c_void, n) as *mut u8 }
    }

    /// # Safety
    /// Same as `memmove()`
    pub unsafe fn memmove(&self, dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        _ = self.validate_load(src as usize, n);
        _ = self.validate_store(dest as usize, n);
        unsafe { real::memmove(dest as *mut c_void, src as *const c_void, n) as *mut u8 }
    }

    /// # Safety
    /// Same as `memset()`
    pub unsafe fn memset(&self, dest: *mut u8, c: c_int, n: usize) -> *mut u8 {
        _ = self.validate_store(dest as usize, n);
        unsafe { real::memset(dest as *mut c_void, c, n) as *mut u8 }
    }

    /// # Safety
    /// Same as `strcpy()`, except that `NULL` is allowed and returned
    pub unsafe fn strcpy(&self, dest: *mut u8, src: *const u8) -> *mut u8 {
        if dest.is_null() || src.is_null() {
            return ptr::null_mut();
        }
        _ = unsafe { self.check_string_op(dest, src) };
        unsafe { real::strcpy(dest as *mut c_char, src as *const c_char) as *mut u8 }
    }

    /// # Safety
    /// Same as `strcat()`, except that `NULL` is allowed and returned
    pub unsafe fn strcat(&self, dest: *mut u8, src: *const u8) -> *mut u8 {
        if dest.is_null() || src.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: the caller guarantees `dest` is a NUL-terminated string
        let end = unsafe { dest.add(strnlen_maybe_garbage(dest, usize::MAX)) };
        _ = unsafe { self.check_string_op(end, src) };
        unsafe { real::strcat(dest as *mut c_char, src as *const c_char) as *mut u8 }
    }

    /// # Safety
    /// Same as `strncpy()`, except that `NULL` is allowed and returned
    pub unsafe fn strncpy(&self, dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        if dest.is_null() || src.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: `src` is NUL-terminated or at least `n` bytes long
        let len = unsafe { strnlen_maybe_garbage(src, n) };
        let read = if len < n { len + 1 } else { n };
        _ = self.validate_load(src as usize, read);
        _ = self.validate_store(dest as usize, n);
        unsafe { real::strncpy(dest as *mut c_char, src as *const c_char, n) as *mut u8 }
    }

    /// # Safety
    /// Same as `strncat()`, except that `NULL` is allowed and returned
    pub unsafe fn strncat(&self, dest: *mut u8, src: *const u8, n: usize) -> *mut u8 {
        if dest.is_null() || src.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: the caller guarantees both are valid strings for `strncat()`
        let (end, len) = unsafe {
            (
                dest.add(strnlen_maybe_garbage(dest, usize::MAX)),
                strnlen_maybe_garbage(src, n),
            )
        };
        let read = if len < n { len + 1 } else { n };
        _ = self.validate_load(src as usize, read);
        _ = self.validate_store(end as usize, len + 1);
        unsafe { real::strncat(dest as *mut c_char, src as *const c_char, n) as *mut u8 }
    }
}
