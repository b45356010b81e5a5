//! The memory/shadow window printed around a faulting address.

use std::fmt;

use serde::Serialize;

use crate::{
    arch::mem::memcpy_maybe_garbage,
    shadow::{codec::BYTES_PER_CELL, ShadowMap, ShadowValue},
};

/// Heap bytes per dump row (two cells)
pub const ROW_BYTES: usize = 2 * BYTES_PER_CELL;
/// Rows printed before and after the faulting one
pub const ROWS_AROUND: usize = 4;
pub const MAX_ROWS: usize = 2 * ROWS_AROUND + 1;

/// Raw bytes of one row, printed as hex
#[derive(Serialize, Clone, Copy, PartialEq, Eq)]
pub struct HexDump {
    buf: [u8; ROW_BYTES],
}

impl HexDump {
    pub const fn new(buf: [u8; ROW_BYTES]) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for HexDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.buf.len() {
            write!(f, "{:02x}", self.buf[i])?;
            if i + 1 != self.buf.len() {
                write!(f, " ")?;
            }
        }
        write!(f, "]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DumpRow {
    pub addr: usize,
    pub bytes: HexDump,
    /// Shadow byte and bit offset of the row's first cell
    pub shadow_addr: usize,
    pub bit_offset: u32,
    pub cells: [ShadowValue; 2],
    /// Index into `bytes` of the faulting byte, if it is in this row
    pub marked_byte: Option<usize>,
    /// Index into `cells` of the cell holding the faulting byte
    pub marked_cell: Option<usize>,
}

impl fmt::Display for DumpRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\t[{:#x}]: ", self.addr)?;
        for (i, byte) in self.bytes.as_bytes().iter().enumerate() {
            if self.marked_byte == Some(i) {
                write!(f, "[{byte:02x}]")?;
            } else {
                write!(f, " {byte:02x} ")?;
            }
        }
        write!(f, "|\t[{:#x} | {:2}]: ", self.shadow_addr, self.bit_offset)?;
        for (i, cell) in self.cells.iter().enumerate() {
            if self.marked_cell == Some(i) {
                write!(f, "[{}]", cell.bits())?;
            } else {
                write!(f, " {} ", cell.bits())?;
            }
        }
        Ok(())
    }
}

/// Collect up to [`MAX_ROWS`] rows centred on `addr`. Rows whose shadow isn't
/// backed are skipped, and the dump stops at the first row whose successor
/// isn't backed.
///
/// # Safety
/// - Heap bytes whose shadow is backed must be mapped for reads. They are
///   read racily and may be garbage.
pub unsafe fn dump_around(map: &ShadowMap, addr: usize) -> Vec<DumpRow> {
    let mut rows = Vec::with_capacity(MAX_ROWS);
    let fault_cell = addr & !(BYTES_PER_CELL - 1);
    let mut row_addr = (addr - addr % ROW_BYTES).wrapping_sub(ROWS_AROUND * ROW_BYTES);

    for _ in 0..MAX_ROWS {
        let this = row_addr;
        row_addr = row_addr.wrapping_add(ROW_BYTES);
        if !map.is_tracked(this) {
            continue;
        }
        if !map.is_tracked(row_addr) {
            break;
        }

        let mut buf = [0; ROW_BYTES];
        // SAFETY: the caller guarantees tracked heap bytes are mapped
        unsafe { memcpy_maybe_garbage(buf.as_mut_ptr(), this as *const u8, ROW_BYTES) };
        let first = map.addr_info(this);
        let second = map.addr_info(this + BYTES_PER_CELL);

        rows.push(DumpRow {
            addr: this,
            bytes: HexDump::new(buf),
            shadow_addr: first.shadow_addr,
            bit_offset: first.bit_offset,
            cells: [first.value, second.value],
            marked_byte: (this..row_addr).contains(&addr).then(|| addr - this),
            marked_cell: (0..2).find(|&i| this + i * BYTES_PER_CELL == fault_cell),
        });
    }
    rows
}
