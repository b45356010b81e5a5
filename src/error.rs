use std::{error::Error, fmt};

use crate::report::FaultReport;

/// Things that can go wrong while maintaining the shadow map itself. None of
/// these are memory faults of the watched program: they mean the sanitizer
/// couldn't do its job for some range, and that range stays untracked.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowError {
    /// The heap base/size can't hold a heap plus its own shadow table
    InvalidLayout { heap_base: usize, heap_size: usize },
    /// The address is not inside the tracked heap range
    OutsideHeap { addr: usize },
    /// The shadow bytes `first..=last` have no backing pages yet
    Unmapped { first: usize, last: usize },
    /// The page source refused to back `addr..addr + size`
    MapFailed { addr: usize, size: usize, errno: i32 },
    /// Every slot in the fixed region pool is taken
    RegionPoolExhausted { capacity: usize },
}

/// Name of an `mmap()` errno, for humans
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::ENOMEM => "ENOMEM", // It's basically just this one
        libc::EACCES => "EACCES",
        libc::EAGAIN => "EAGAIN",
        libc::EBADF => "EBADF",
        libc::EEXIST => "EEXIST",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        _ => "unknown",
    }
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ShadowError::InvalidLayout {
                heap_base,
                heap_size,
            } => write!(
                f,
                "heap at {heap_base:#x} of {heap_size:#x} bytes cannot hold its shadow table"
            ),
            ShadowError::OutsideHeap { addr } => {
                write!(f, "address {addr:#x} is outside the tracked heap")
            }
            ShadowError::Unmapped { first, last } => {
                write!(f, "shadow bytes {first:#x}..={last:#x} are not mapped")
            }
            ShadowError::MapFailed { addr, size, errno } => write!(
                f,
                "could not map {size:#x} shadow bytes at {addr:#x}, errno = {}",
                errno_name(errno)
            ),
            ShadowError::RegionPoolExhausted { capacity } => {
                write!(f, "all {capacity} shadow region slots are in use")
            }
        }
    }
}

impl Error for ShadowError {}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    InvalidNumber { var: &'static str, value: String },
    InvalidValue { var: &'static str, value: String },
    Layout(ShadowError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "{var} is not set"),
            ConfigError::InvalidNumber { var, value } => {
                write!(f, "{var}={value:?} is not a number")
            }
            ConfigError::InvalidValue { var, value } => {
                write!(f, "{var}={value:?} is not an accepted value")
            }
            ConfigError::Layout(e) => write!(f, "bad heap layout: {e}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Layout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShadowError> for ConfigError {
    fn from(e: ShadowError) -> Self {
        ConfigError::Layout(e)
    }
}

/// Why a `free()` was refused. The real allocator never sees these pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreeError {
    /// Nothing was ever allocated here: the shadow isn't even backed
    Unallocated { addr: usize },
    /// The block is already free, or its shadow is in a state no live block
    /// can be in
    Rejected(FaultReport),
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::Unallocated { addr } => write!(f, "free of unallocated memory at {addr:#x}"),
            FreeError::Rejected(report) => write!(
                f,
                "free of {:#x} rejected: {}",
                report.access_addr,
                report.diagnosis.label()
            ),
        }
    }
}

impl Error for FreeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_failures_name_their_errno() {
        let e = ShadowError::MapFailed {
            addr: 0x1000,
            size: 0x2000,
            errno: libc::ENOMEM,
        };
        assert_eq!(
            e.to_string(),
            "could not map 0x2000 shadow bytes at 0x1000, errno = ENOMEM"
        );
    }

    #[test]
    fn layout_errors_are_the_config_error_source() {
        let e = ConfigError::from(ShadowError::InvalidLayout {
            heap_base: 0,
            heap_size: 16,
        });
        assert!(e.source().is_some());
        assert!(e.to_string().starts_with("bad heap layout"));
    }
}
