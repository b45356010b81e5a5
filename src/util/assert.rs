/// Test if `addr` is aligned to a multiple of `align`
pub fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}
