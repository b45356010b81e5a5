/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// `round_up()` for power-of-two `align`, without the division
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// `round_down()` for power-of-two `align`, without the division
pub const fn align_down(n: usize, align: usize) -> usize {
    n & !(align - 1)
}
