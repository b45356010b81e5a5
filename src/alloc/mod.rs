pub mod heap;
pub(crate) mod real;

pub use heap::{HeapAllocator, LibcHeap};
