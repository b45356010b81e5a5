use std::fmt::{self, Write};

/// Size of the stack buffer a single diagnostic line is formatted into. Longer
/// lines are truncated.
pub const LINE_BUF_SIZE: usize = 512;

/// A `fmt::Write` into a fixed array. Never allocates, never fails: anything
/// past the end of the buffer is dropped.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// `write(2)` the whole of `bytes` to `fd`... but safe (doesn't use the
/// allocator, so it's fine to call while the heap is in a weird state)
pub fn write_fd(fd: libc::c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, so the pointer is valid for
        // `bytes.len()` reads
        let n = unsafe { libc::write(fd, bytes.as_ptr() as _, bytes.len()) };
        if n <= 0 {
            // EINTR is the only one worth retrying and it's basically never
            // going to happen for stderr
            if n < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Format `args` with a `prefix` and `suffix` into a stack buffer and
/// `write_fd()` it
pub fn put_fd(fd: libc::c_int, prefix: &str, args: fmt::Arguments<'_>, suffix: &str) {
    let mut line = StackWriter::<LINE_BUF_SIZE>::new();
    line.push_bytes(prefix.as_bytes());
    _ = line.write_fmt(args);
    line.push_bytes(suffix.as_bytes());
    write_fd(fd, line.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_writer_truncates_instead_of_failing() {
        let mut w = StackWriter::<8>::new();
        write!(w, "{:#x}", 0xdead_beef_u32).unwrap();
        assert_eq!(w.as_bytes(), b"0xdeadbe");
        write!(w, "more").unwrap();
        assert_eq!(w.as_bytes().len(), 8);
    }

    #[test]
    fn stack_writer_formats_like_format() {
        let mut w = StackWriter::<64>::new();
        write!(w, "[{:02x}] {:>3}", 7u8, 42).unwrap();
        assert_eq!(w.as_bytes(), format!("[{:02x}] {:>3}", 7u8, 42).as_bytes());
    }
}
