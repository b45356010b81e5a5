//! A shadow-memory heap sanitizer. Every 4-byte cell of a configured heap
//! range has a 2-bit state in a shadow area that sits right after the heap;
//! allocation wrappers keep it current, and instrumentation hooks check
//! accesses against it.

pub mod alloc;
pub mod arch;
pub mod config;
pub mod error;
pub mod externc;
pub mod guard;
mod lazy_lock;
pub mod os;
pub mod report;
pub mod sanitizer;
pub mod shadow;
pub mod util;

#[cfg(test)]
mod testing;

pub use alloc::{HeapAllocator, LibcHeap};
pub use config::{Config, OnFault, SinkKind};
pub use error::{ConfigError, FreeError, ShadowError};
pub use report::{Diagnosis, FaultKind, FaultReport, ReportSink};
pub use sanitizer::Sanitizer;
pub use shadow::{ShadowLayout, ShadowValue};
