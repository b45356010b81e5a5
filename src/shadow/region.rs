//! Fixed-capacity bookkeeping of which shadow pages are backed.

use serde::Serialize;

/// Number of disjoint shadow regions we can ever track. The table lives
/// inline, so growing it can't recurse into the allocator we are watching.
pub const REGION_CAPACITY: usize = 16;

/// A backed, contiguous run of shadow bytes `start..start + size`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShadowRegion {
    pub start: usize,
    pub size: usize,
}

impl ShadowRegion {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Is the closed span `first..=last` inside this region?
    pub fn covers(&self, first: usize, last: usize) -> bool {
        first >= self.start && last < self.end()
    }
}

pub struct RegionTable {
    slots: [ShadowRegion; REGION_CAPACITY],
    len: usize,
}

impl RegionTable {
    pub const fn new() -> Self {
        Self {
            slots: [ShadowRegion { start: 0, size: 0 }; REGION_CAPACITY],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == REGION_CAPACITY
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShadowRegion> {
        self.slots[..self.len].iter()
    }

    /// Copy of the live regions, sorted by start address
    pub fn snapshot(&self) -> Vec<ShadowRegion> {
        let mut regions = self.slots[..self.len].to_vec();
        regions.sort_unstable_by_key(|r| r.start);
        regions
    }

    /// `true` iff a single region contains every byte of `first..=last`
    pub fn is_mapped(&self, first: usize, last: usize) -> bool {
        self.iter().any(|r| r.covers(first, last))
    }

    pub fn containing(&self, addr: usize) -> Option<ShadowRegion> {
        self.iter().find(|r| r.covers(addr, addr)).copied()
    }

    /// Start of the lowest region beginning strictly after `addr`
    pub fn next_start_after(&self, addr: usize) -> Option<usize> {
        self.iter()
            .map(|r| r.start)
            .filter(|&start| start > addr)
            .min()
    }

    /// Would recording the gap `start..end` take up a fresh slot? It won't if
    /// it extends a region that ends at `start` or one that begins at `end`.
    pub fn needs_slot(&self, start: usize, end: usize) -> bool {
        !self.iter().any(|r| r.end() == start || r.start == end)
    }

    /// Record the freshly backed gap `start..end`, which must not overlap any
    /// region. Regions touching either side are grown to absorb it (and each
    /// other), so the table never holds two adjacent regions.
    ///
    /// # Panics
    /// - If a new slot is needed and the table is full. Check
    ///   [`Self::needs_slot()`] first.
    pub fn insert_merging(&mut self, start: usize, end: usize) {
        debug_assert!(start < end);
        let below = self.slots[..self.len].iter().position(|r| r.end() == start);
        let above = self.slots[..self.len].iter().position(|r| r.start == end);

        match (below, above) {
            (Some(lo), Some(hi)) => {
                let hi_end = self.slots[hi].end();
                self.slots[lo].size = hi_end - self.slots[lo].start;
                self.swap_remove(hi);
            }
            (Some(lo), None) => self.slots[lo].size = end - self.slots[lo].start,
            (None, Some(hi)) => {
                let hi_end = self.slots[hi].end();
                self.slots[hi] = ShadowRegion {
                    start,
                    size: hi_end - start,
                };
            }
            (None, None) => {
                assert!(!self.is_full(), "shadow region table is full");
                self.slots[self.len] = ShadowRegion {
                    start,
                    size: end - start,
                };
                self.len += 1;
            }
        }
    }

    fn swap_remove(&mut self, index: usize) {
        self.len -= 1;
        self.slots[index] = self.slots[self.len];
        self.slots[self.len] = ShadowRegion::default();
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}
