/// Read a single byte from `src`. `src` can have **no provenance**, which is
/// what we want when we peek at heap bytes that belong to the program we are
/// watching (they might be in a redzone, they might be freed, we don't care).
///
/// # Safety
/// - `src` must be mapped for reads. That's it: the SIGSEGV you might get
///   otherwise is up to the arch ;)
#[inline(always)]
pub unsafe fn u8_load_acq(src: *const u8) -> u8 {
    debug_assert!(!src.is_null());

    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::asm;

        let dst: u8;
        // In x86, things are properly ordered by default, and byte loads are
        // atomic!
        unsafe {
            asm! {
                "mov {dst}, byte ptr [{src}]",
                src = in(reg) src,
                dst = out(reg_byte) dst,
                options(nostack, preserves_flags, readonly),
            }
        }
        dst
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        // Volatile is the closest portable thing: the compiler can't reason
        // about the load, so it can't use the lack of provenance against us
        unsafe { std::ptr::read_volatile(src) }
    }
}

/// Copy `count` bytes that might be *absolute garbage* (redzones, freed
/// blocks) out of the watched heap and into `dst`.
///
/// # Safety
/// - `src..src + count` must be mapped for reads
/// - `dst` must be valid for `count` writes and not overlap `src`
#[inline(always)]
pub unsafe fn memcpy_maybe_garbage(dst: *mut u8, src: *const u8, count: usize) {
    for i in 0..count {
        unsafe { dst.add(i).write(u8_load_acq(src.add(i))) };
    }
}

/// `strnlen()` over bytes read with [`u8_load_acq()`], so it never goes
/// through an interposed string function and never minds a redzone.
///
/// # Safety
/// - `s..s + max` must be mapped, or hold a NUL before the unmapped part
pub unsafe fn strnlen_maybe_garbage(s: *const u8, max: usize) -> usize {
    let mut len = 0;
    while len < max && unsafe { u8_load_acq(s.add(len)) } != 0 {
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_see_the_bytes_that_are_there() {
        let buf = *b"hsan\0tail";
        let mut out = [0u8; 4];
        unsafe {
            assert_eq!(u8_load_acq(buf.as_ptr().add(2)), b'a');
            memcpy_maybe_garbage(out.as_mut_ptr(), buf.as_ptr(), 4);
            assert_eq!(strnlen_maybe_garbage(buf.as_ptr(), usize::MAX), 4);
            assert_eq!(strnlen_maybe_garbage(buf.as_ptr(), 3), 3);
        }
        assert_eq!(&out, b"hsan");
    }
}
