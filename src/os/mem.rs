use std::ptr::NonNull;

use libc::{__errno_location, mmap, MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use once_cell::sync::Lazy;

use crate::{error::ShadowError, util::hint::cold};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

pub(crate) fn errno() -> i32 {
    // SAFETY: `__errno_location()` always returns this thread's errno slot
    unsafe { *__errno_location() }
}

/// Something that can hand out zero-filled, read/write pages at a fixed
/// address. This is the only way the shadow table gets backing memory.
///
/// # Safety
/// - On `Ok`, `addr..addr + size` must be mapped read/write and zero-filled,
///   and must stay mapped for the life of the source
/// - Pages must not be handed out through the general allocator, since
///   callers hold the shadow guard while reserving
pub unsafe trait PageSource: Send + Sync {
    /// Back `addr..addr + size` with fresh pages. Both are page-aligned.
    ///
    /// # Safety
    /// - `addr..addr + size` must not hold anything the caller still needs:
    ///   whatever was mapped there is replaced
    unsafe fn reserve_pages(&self, addr: usize, size: usize) -> Result<NonNull<u8>, ShadowError>;
}

/// [`PageSource`] over anonymous `mmap()` with `MAP_FIXED`
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPages;

unsafe impl PageSource for MmapPages {
    unsafe fn reserve_pages(&self, addr: usize, size: usize) -> Result<NonNull<u8>, ShadowError> {
        // SAFETY: the caller guarantees nothing live is at `addr`
        let ptr = unsafe {
            mmap(
                addr as *mut _,
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return cold(|| {
                Err(ShadowError::MapFailed {
                    addr,
                    size,
                    errno: errno(),
                })
            });
        }
        NonNull::new(ptr as *mut u8).ok_or(ShadowError::MapFailed {
            addr,
            size,
            errno: libc::EINVAL,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MmapRegion;

    #[test]
    fn regions_are_page_rounded_and_writable() {
        let region = MmapRegion::map_noreserve(100).unwrap();
        assert_eq!(region.size(), *PAGE_SIZE);
        assert_eq!(region.addr() % *PAGE_SIZE, 0);
        unsafe {
            region.as_ptr().write(42);
            assert_eq!(region.as_ptr().read(), 42);
        }
    }

    #[test]
    fn zero_sized_regions_are_refused() {
        assert!(matches!(
            MmapRegion::map_noreserve(0),
            Err(ShadowError::MapFailed { errno: libc::EINVAL, .. })
        ));
    }

    #[test]
    fn reserved_pages_are_zeroed() {
        let region = MmapRegion::map_noreserve(4 * *PAGE_SIZE).unwrap();
        let target = region.addr() + *PAGE_SIZE;
        unsafe {
            (target as *mut u8).write(0xaa);
            let ptr = MmapPages.reserve_pages(target, *PAGE_SIZE).unwrap();
            assert_eq!(ptr.as_ptr() as usize, target);
            assert_eq!(ptr.as_ptr().read(), 0);
        }
    }
}
