//! Shadow memory: the per-heap-byte safety state and the pages backing it.

pub mod codec;
pub mod mapper;
pub mod region;

use std::slice;

use serde::Serialize;

pub use self::{
    codec::{ShadowLayout, ShadowValue, OVERHEAD, RZ_SIZE},
    region::{RegionTable, ShadowRegion, REGION_CAPACITY},
};
use self::codec::BYTES_PER_SHADOW_BYTE;
use crate::{error::ShadowError, os::mem::PageSource};

/// Everything we know about one heap address, captured at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddrInfo {
    pub mem_addr: usize,
    pub shadow_addr: usize,
    pub bit_offset: u32,
    pub value: ShadowValue,
    /// Whether the shadow byte is backed. An unmapped cell always reads as
    /// accessible.
    pub mapped: bool,
}

/// The shadow table of one heap. Not synchronised: the sanitizer keeps it
/// behind its guard.
pub struct ShadowMap {
    layout: ShadowLayout,
    regions: RegionTable,
}

impl ShadowMap {
    pub const fn new(layout: ShadowLayout) -> Self {
        Self {
            layout,
            regions: RegionTable::new(),
        }
    }

    pub fn layout(&self) -> &ShadowLayout {
        &self.layout
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Is the shadow cell for `addr` backed?
    pub fn is_tracked(&self, addr: usize) -> bool {
        self.layout
            .mem_to_shadow(addr)
            .is_some_and(|pos| self.regions.is_mapped(pos.shadow_addr, pos.shadow_addr))
    }

    /// Decode the state of `addr`. Addresses outside the heap, or whose shadow
    /// isn't backed, read as [`ShadowValue::Accessible`].
    pub fn addr_info(&self, addr: usize) -> AddrInfo {
        let Some(pos) = self.layout.mem_to_shadow(addr) else {
            return AddrInfo {
                mem_addr: addr,
                shadow_addr: 0,
                bit_offset: 0,
                value: ShadowValue::Accessible,
                mapped: false,
            };
        };
        let mapped = self.regions.is_mapped(pos.shadow_addr, pos.shadow_addr);
        let value = if mapped {
            // SAFETY: the shadow byte is inside a backed region
            let byte = unsafe { *(pos.shadow_addr as *const u8) };
            ShadowValue::from_bits(byte >> pos.bit_offset)
        } else {
            ShadowValue::Accessible
        };
        AddrInfo {
            mem_addr: addr,
            shadow_addr: pos.shadow_addr,
            bit_offset: pos.bit_offset,
            value,
            mapped,
        }
    }

    #[inline]
    pub fn value_at(&self, addr: usize) -> ShadowValue {
        self.addr_info(addr).value
    }

    /// Back the shadow for the heap range `start..end` (clamped to the heap).
    /// Returns the number of shadow bytes newly backed.
    pub fn ensure_mapped<P>(&mut self, pages: &P, start: usize, end: usize) -> Result<usize, ShadowError>
    where
        P: PageSource + ?Sized,
    {
        let (first, last) = self
            .layout
            .shadow_span(start, end)
            .ok_or(ShadowError::OutsideHeap { addr: start })?;
        mapper::ensure_mapped(&mut self.regions, pages, first, last, self.layout.page_size())
    }

    /// Is the whole shadow of `start..end` backed? Empty ranges are.
    pub fn is_range_mapped(&self, start: usize, end: usize) -> bool {
        match self.layout.shadow_span(start, end) {
            Some((first, last)) => self.regions.is_mapped(first, last),
            None => start >= end,
        }
    }

    /// Set every cell touched by the heap range `start..end` to `value`. The
    /// range is clamped to the heap; its shadow must already be backed.
    pub fn paint(&mut self, start: usize, end: usize, value: ShadowValue) -> Result<(), ShadowError> {
        let Some((first, last)) = self.layout.shadow_span(start, end) else {
            return if start >= end {
                Ok(())
            } else {
                Err(ShadowError::OutsideHeap { addr: start })
            };
        };
        if !self.regions.is_mapped(first, last) {
            return Err(ShadowError::Unmapped { first, last });
        }
        // Heap address described by bit 0 of `first`
        let origin =
            self.layout.heap_base() + (first - self.layout.shadow_base()) * BYTES_PER_SHADOW_BYTE;
        let start = start.max(self.layout.heap_base());
        let end = end.min(self.layout.heap_end());

        // SAFETY: `first..=last` is inside one backed region, and we hold
        // `&mut self`, so nothing else is looking at these bytes through us
        let shadow = unsafe { slice::from_raw_parts_mut(first as *mut u8, last - first + 1) };
        codec::fill_cells(shadow, start - origin, end - origin, value);
        Ok(())
    }
}
