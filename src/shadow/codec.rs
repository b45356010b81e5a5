//! The 2-bit-per-cell shadow encoding, and the arithmetic that maps heap
//! addresses onto shadow bytes.
//!
//! One shadow byte describes 16 heap bytes as 4 cells. Cell `i` lives in
//! bits `2i..2i + 2` and covers heap bytes `4i..4i + 4` of the 16.

use serde::Serialize;

use crate::{
    error::ShadowError,
    util::{
        assert::aligned_to,
        num::{align_down, align_up},
    },
};

pub const BITS_PER_CELL: u32 = 2;
pub const BYTES_PER_CELL: usize = 4;
pub const CELLS_PER_BYTE: usize = 4;
/// Heap bytes described by one shadow byte
pub const BYTES_PER_SHADOW_BYTE: usize = BYTES_PER_CELL * CELLS_PER_BYTE;
/// Allocation bodies are rounded up to this before the post-redzone starts
pub const RZ_SIZE: usize = BYTES_PER_CELL;
/// Size of the allocator's chunk header, which doubles as the pre-redzone
pub const OVERHEAD: usize = 2 * std::mem::size_of::<usize>();

const CELL_MASK: u8 = 0b11;
/// Bit offset of the highest cell in a shadow byte
const LAST_CELL_BIT: u32 = (CELLS_PER_BYTE as u32 - 1) * BITS_PER_CELL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ShadowValue {
    Accessible = 0b00,
    /// Reserved for internal painting, never written by the allocation paths
    Paint = 0b01,
    Redzone = 0b10,
    AfterFree = 0b11,
}

impl ShadowValue {
    /// Decode the low 2 bits of `bits`
    pub const fn from_bits(bits: u8) -> Self {
        match bits & CELL_MASK {
            0b00 => ShadowValue::Accessible,
            0b01 => ShadowValue::Paint,
            0b10 => ShadowValue::Redzone,
            _ => ShadowValue::AfterFree,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// This value written into all 4 cells of a shadow byte
    pub const fn replicated(self) -> u8 {
        self.bits() * 0b0101_0101
    }

    pub const fn is_accessible(self) -> bool {
        matches!(self, ShadowValue::Accessible)
    }
}

/// Where the state of one heap byte lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPos {
    pub shadow_addr: usize,
    pub bit_offset: u32,
}

/// The fixed geometry of one tracked heap and its shadow table. The shadow
/// table occupies the top `heap_size / 17` bytes of the heap's own address
/// range, so the usable heap is `heap_base..shadow_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowLayout {
    heap_base: usize,
    heap_size: usize,
    shadow_base: usize,
    page_size: usize,
}

impl ShadowLayout {
    /// Compute the layout for the heap `heap_base..heap_base + heap_size`.
    /// `page_size` must be a power of two, and both the base and the size
    /// must be multiples of it.
    pub fn new(heap_base: usize, heap_size: usize, page_size: usize) -> Result<Self, ShadowError> {
        let invalid = ShadowError::InvalidLayout {
            heap_base,
            heap_size,
        };
        if !page_size.is_power_of_two()
            || heap_size == 0
            || !aligned_to(heap_base, page_size)
            || !aligned_to(heap_size, page_size)
        {
            return Err(invalid);
        }
        let heap_top = heap_base.checked_add(heap_size).ok_or(invalid.clone())?;
        let table = heap_size / (BYTES_PER_SHADOW_BYTE + 1);
        let shadow_base = align_down(heap_base + table * BYTES_PER_SHADOW_BYTE, page_size);
        if shadow_base <= heap_base || heap_top - shadow_base < page_size {
            return Err(invalid);
        }
        Ok(Self {
            heap_base,
            heap_size,
            shadow_base,
            page_size,
        })
    }

    pub fn heap_base(&self) -> usize {
        self.heap_base
    }

    /// One past the last tracked heap byte. Also where the shadow table starts.
    pub fn heap_end(&self) -> usize {
        self.shadow_base
    }

    pub fn shadow_base(&self) -> usize {
        self.shadow_base
    }

    /// One past the last byte the shadow table may ever use
    pub fn shadow_end(&self) -> usize {
        self.heap_base + self.heap_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.heap_base..self.shadow_base).contains(&addr)
    }

    /// Translate a heap address, or `None` if it is not tracked at all
    #[inline]
    pub fn mem_to_shadow(&self, addr: usize) -> Option<ShadowPos> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.heap_base;
        Some(ShadowPos {
            shadow_addr: self.shadow_base + offset / BYTES_PER_SHADOW_BYTE,
            bit_offset: cell_bit(offset),
        })
    }

    /// The closed span of shadow bytes describing the heap range `start..end`,
    /// clamped to the tracked heap. `None` if nothing in the range is tracked.
    pub fn shadow_span(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let start = start.max(self.heap_base);
        let end = end.min(self.shadow_base);
        if start >= end {
            return None;
        }
        let first = self.mem_to_shadow(start)?.shadow_addr;
        let last = self.mem_to_shadow(end - 1)?.shadow_addr;
        Some((first, last))
    }

    /// Page-aligned `[start, end)` that backs the closed shadow span `first..=last`
    pub fn page_span(&self, first: usize, last: usize) -> (usize, usize) {
        (
            align_down(first, self.page_size),
            align_up(last + 1, self.page_size),
        )
    }
}

/// Bit offset of the cell holding heap offset `offset`
#[inline]
pub const fn cell_bit(offset: usize) -> u32 {
    ((offset % BYTES_PER_SHADOW_BYTE) / BYTES_PER_CELL) as u32 * BITS_PER_CELL
}

/// Mask covering the cells at bit offsets `from..=to` (both cell-aligned)
#[inline]
pub const fn span_mask(from: u32, to: u32) -> u8 {
    let below = (0xffu16 << from) as u8;
    let above = (0xffu16 << (to + BITS_PER_CELL)) as u8;
    below & !above
}

#[inline]
fn blend(byte: &mut u8, mask: u8, fill: u8) {
    *byte = (*byte & !mask) | (fill & mask);
}

/// Read the cell for heap offset `offset`, where `shadow[0]` describes heap
/// offsets `0..16`.
#[inline]
pub fn read_cell(shadow: &[u8], offset: usize) -> ShadowValue {
    let byte = shadow[offset / BYTES_PER_SHADOW_BYTE];
    ShadowValue::from_bits(byte >> cell_bit(offset))
}

/// Set every cell touched by heap offsets `start..end` to `value`, leaving all
/// other cells alone. `shadow[0]` describes heap offsets `0..16`.
///
/// # Panics
/// - If `shadow` is too short to hold `end - 1`
pub fn fill_cells(shadow: &mut [u8], start: usize, end: usize, value: ShadowValue) {
    if start >= end {
        return;
    }
    let fill = value.replicated();
    let (first, first_bit) = (start / BYTES_PER_SHADOW_BYTE, cell_bit(start));
    let (last, last_bit) = (
        (end - 1) / BYTES_PER_SHADOW_BYTE,
        cell_bit(end - 1),
    );

    if first == last {
        blend(&mut shadow[first], span_mask(first_bit, last_bit), fill);
        return;
    }

    let mut lo = first;
    if first_bit > 0 {
        blend(&mut shadow[first], span_mask(first_bit, LAST_CELL_BIT), fill);
        lo += 1;
    }
    let mut hi = last + 1;
    if last_bit < LAST_CELL_BIT {
        blend(&mut shadow[last], span_mask(0, last_bit), fill);
        hi -= 1;
    }
    if hi > lo {
        shadow[lo..hi].fill(fill);
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    const ALL: [ShadowValue; 4] = [
        ShadowValue::Accessible,
        ShadowValue::Paint,
        ShadowValue::Redzone,
        ShadowValue::AfterFree,
    ];

    #[test]
    fn replicated_bytes_are_correct() {
        assert_eq!(ShadowValue::Accessible.replicated(), 0x00);
        assert_eq!(ShadowValue::Paint.replicated(), 0x55);
        assert_eq!(ShadowValue::Redzone.replicated(), 0xaa);
        assert_eq!(ShadowValue::AfterFree.replicated(), 0xff);
        for v in ALL {
            assert_eq!(ShadowValue::from_bits(v.bits()), v);
        }
    }

    #[test]
    fn span_masks_compute_correctly() {
        assert_eq!(span_mask(0, 0), 0b0000_0011);
        assert_eq!(span_mask(2, 2), 0b0000_1100);
        assert_eq!(span_mask(2, 4), 0b0011_1100);
        assert_eq!(span_mask(4, 6), 0b1111_0000);
        assert_eq!(span_mask(0, 6), 0xff);
    }

    #[test]
    pub fn fill_changes_exactly_the_touched_cells() {
        for len in [1, 3, 4, 5, 16, 17, 33] {
            for start in 0..20 {
                for value in ALL {
                    // Pick a background that differs from `value`
                    let background = ShadowValue::from_bits(value.bits() ^ 0b10);
                    let mut shadow = [background.replicated(); 8];
                    let end = start + len;
                    fill_cells(&mut shadow, start, end, value);

                    let first_cell = start / BYTES_PER_CELL;
                    let last_cell = (end - 1) / BYTES_PER_CELL;
                    for off in (0..shadow.len() * BYTES_PER_SHADOW_BYTE).step_by(BYTES_PER_CELL) {
                        let cell = off / BYTES_PER_CELL;
                        let expect = if (first_cell..=last_cell).contains(&cell) {
                            value
                        } else {
                            background
                        };
                        assert_eq!(
                            read_cell(&shadow, off),
                            expect,
                            "start = {start}, len = {len}, offset = {off}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn empty_fills_are_nops() {
        let mut shadow = [0x5a; 2];
        fill_cells(&mut shadow, 7, 7, ShadowValue::AfterFree);
        fill_cells(&mut shadow, 9, 3, ShadowValue::AfterFree);
        assert_eq!(shadow, [0x5a; 2]);
    }

    #[test]
    fn layout_fits_shadow_above_heap() {
        let layout = ShadowLayout::new(0x10_0000, 0x110_0000, 4096).unwrap();
        assert_eq!(layout.shadow_base(), 0x10_0000 + 0x100_0000);
        let last = layout.mem_to_shadow(layout.heap_end() - 1).unwrap();
        assert!(last.shadow_addr < layout.shadow_end());
        assert!(layout.mem_to_shadow(layout.heap_end()).is_none());
        assert!(layout.mem_to_shadow(layout.heap_base() - 1).is_none());
    }

    #[test]
    fn degenerate_layouts_are_rejected() {
        assert!(ShadowLayout::new(0x1000, 0, 4096).is_err());
        assert!(ShadowLayout::new(0x1000, 0x1000, 4096).is_err());
        assert!(ShadowLayout::new(usize::MAX - 10, 0x10_0000, 4096).is_err());
        assert!(ShadowLayout::new(0x1000, 0x10_0000, 3000).is_err());
    }

    #[test]
    fn translation_is_monotone_and_injective_per_block() {
        let layout = ShadowLayout::new(0x4000_0000, 0x220_0000, 4096).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let a = rng.gen_range(layout.heap_base()..layout.heap_end() - 1);
            let b = rng.gen_range(a..layout.heap_end());
            let (pa, pb) = (
                layout.mem_to_shadow(a).unwrap(),
                layout.mem_to_shadow(b).unwrap(),
            );
            assert!(pa.shadow_addr <= pb.shadow_addr);

            // Within a 16-byte block, distinct cells get distinct positions
            let block = a & !(BYTES_PER_SHADOW_BYTE - 1);
            if block >= layout.heap_base() {
                let mut seen = Vec::new();
                for cell in 0..CELLS_PER_BYTE {
                    let pos = layout.mem_to_shadow(block + cell * BYTES_PER_CELL).unwrap();
                    assert!(!seen.contains(&pos));
                    seen.push(pos);
                }
            }
        }
    }

    #[test]
    fn page_spans_cover_the_last_byte() {
        let layout = ShadowLayout::new(0x10_0000, 0x110_0000, 4096).unwrap();
        let base = layout.shadow_base();
        assert_eq!(layout.page_span(base, base + 4095), (base, base + 4096));
        assert_eq!(layout.page_span(base + 4095, base + 4096), (base, base + 8192));
        assert_eq!(
            layout.shadow_span(layout.heap_base(), layout.heap_base() + 17),
            Some((base, base + 1))
        );
    }
}
