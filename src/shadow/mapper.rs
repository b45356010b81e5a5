//! Lazily backing shadow pages as allocations reach new parts of the heap.

use log::{debug, error, trace};

use super::region::{RegionTable, REGION_CAPACITY};
use crate::{
    error::ShadowError,
    os::mem::PageSource,
    util::num::{align_down, align_up},
};

/// Make sure the closed shadow span `first..=last` is backed, growing the
/// region table as needed. Returns how many bytes were newly backed (0 if the
/// span was mapped already).
///
/// Only the gaps that no region covers are requested from `pages`, so a span
/// that is already partly backed never has its existing shadow replaced. On
/// failure, the gaps backed before the failing one stay recorded and nothing
/// else changes.
pub fn ensure_mapped<P>(
    regions: &mut RegionTable,
    pages: &P,
    first: usize,
    last: usize,
    page_size: usize,
) -> Result<usize, ShadowError>
where
    P: PageSource + ?Sized,
{
    debug_assert!(first <= last);
    if regions.is_mapped(first, last) {
        return Ok(0);
    }

    let start = align_down(first, page_size);
    let end = align_up(last + 1, page_size);
    let mut cursor = start;
    let mut backed = 0;

    while cursor < end {
        if let Some(region) = regions.containing(cursor) {
            cursor = region.end();
            continue;
        }
        let gap_end = regions
            .next_start_after(cursor)
            .map_or(end, |next| next.min(end));

        if regions.is_full() && regions.needs_slot(cursor, gap_end) {
            error!(
                "cannot track shadow {cursor:#x}..{gap_end:#x}: all {REGION_CAPACITY} region slots are in use"
            );
            return Err(ShadowError::RegionPoolExhausted {
                capacity: REGION_CAPACITY,
            });
        }

        // SAFETY: `cursor..gap_end` is outside every region, so no shadow
        // state lives there yet
        if let Err(e) = unsafe { pages.reserve_pages(cursor, gap_end - cursor) } {
            error!("{e}");
            return Err(e);
        }
        regions.insert_merging(cursor, gap_end);
        trace!("backed shadow {cursor:#x}..{gap_end:#x}");

        backed += gap_end - cursor;
        cursor = gap_end;
    }

    debug!(
        "shadow {first:#x}..={last:#x}: {backed:#x} new bytes, {} region(s)",
        regions.len()
    );
    Ok(backed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPages;

    const PAGE: usize = 4096;

    #[test]
    fn mapping_twice_requests_pages_once() {
        let pages = RecordingPages::new(64 * PAGE);
        let base = pages.base();
        let mut regions = RegionTable::new();

        let backed = ensure_mapped(&mut regions, &pages, base + 10, base + 20, PAGE).unwrap();
        assert_eq!(backed, PAGE);
        assert_eq!(ensure_mapped(&mut regions, &pages, base + 10, base + 20, PAGE), Ok(0));
        assert_eq!(ensure_mapped(&mut regions, &pages, base, base + PAGE - 1, PAGE), Ok(0));
        assert_eq!(pages.requests(), vec![(base, PAGE)]);
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn adjacent_spans_coalesce() {
        let pages = RecordingPages::new(64 * PAGE);
        let base = pages.base();
        let mut regions = RegionTable::new();

        ensure_mapped(&mut regions, &pages, base, base + 4095, PAGE).unwrap();
        ensure_mapped(&mut regions, &pages, base + 4095, base + 4098, PAGE).unwrap();
        assert_eq!(pages.requests(), vec![(base, PAGE), (base + PAGE, PAGE)]);
        assert_eq!(regions.snapshot().len(), 1);
        assert_eq!(regions.snapshot()[0].size, 2 * PAGE);
    }

    #[test]
    fn only_gaps_are_backed() {
        let pages = RecordingPages::new(64 * PAGE);
        let base = pages.base();
        let mut regions = RegionTable::new();

        ensure_mapped(&mut regions, &pages, base + 2 * PAGE, base + 3 * PAGE - 1, PAGE).unwrap();
        ensure_mapped(&mut regions, &pages, base + 5 * PAGE, base + 5 * PAGE, PAGE).unwrap();
        let backed = ensure_mapped(&mut regions, &pages, base, base + 6 * PAGE - 1, PAGE).unwrap();
        assert_eq!(backed, 4 * PAGE);
        assert_eq!(
            pages.requests()[2..],
            [(base, 2 * PAGE), (base + 3 * PAGE, 2 * PAGE)]
        );
        assert_eq!(regions.len(), 1);
        assert!(regions.is_mapped(base, base + 6 * PAGE - 1));
    }

    #[test]
    fn exhausting_the_pool_fails_without_mapping() {
        let pages = RecordingPages::new((2 * REGION_CAPACITY + 2) * PAGE);
        let base = pages.base();
        let mut regions = RegionTable::new();
        for i in 0..REGION_CAPACITY {
            let at = base + 2 * i * PAGE;
            ensure_mapped(&mut regions, &pages, at, at, PAGE).unwrap();
        }
        let before = pages.requests().len();
        let at = base + 2 * REGION_CAPACITY * PAGE + PAGE;
        assert_eq!(
            ensure_mapped(&mut regions, &pages, at, at, PAGE),
            Err(ShadowError::RegionPoolExhausted {
                capacity: REGION_CAPACITY
            })
        );
        assert_eq!(pages.requests().len(), before);

        // Filling a hole between two regions doesn't need a slot
        let hole = base + PAGE;
        assert_eq!(ensure_mapped(&mut regions, &pages, hole, hole, PAGE), Ok(PAGE));
        assert_eq!(regions.len(), REGION_CAPACITY - 1);
    }

    #[test]
    fn failed_reservations_register_nothing() {
        let pages = RecordingPages::new(4 * PAGE).failing();
        let base = pages.base();
        let mut regions = RegionTable::new();
        assert!(matches!(
            ensure_mapped(&mut regions, &pages, base, base, PAGE),
            Err(ShadowError::MapFailed { .. })
        ));
        assert!(regions.is_empty());
    }
}
