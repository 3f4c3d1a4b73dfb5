//! Error types reported by the allocator.

use core::{fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

use crate::backing::ReserveError;

/// Source location at which an error was raised.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Failure of [`SlabAllocator::allocate`](crate::SlabAllocator::allocate).
///
/// Only growth can fail. The allocator itself stays usable: a later call may
/// succeed once backing memory becomes available again.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("out of memory: cannot reserve a {size}-byte chunk"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: ReserveError,
    },
}

/// A pointer rejected by [`SlabAllocator::deallocate`](crate::SlabAllocator::deallocate).
///
/// Rejection is not fatal. The call that reports it leaves every bitmap
/// untouched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InvalidPointer {
    #[snafu(display("pointer {addr:#x} does not belong to any chunk"))]
    Foreign {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "pointer {addr:#x} is {offset} bytes into chunk #{chunk}, not on a {block_size}-byte block boundary"
    ))]
    Misaligned {
        addr: usize,
        chunk: usize,
        offset: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {index} at {addr:#x} in chunk #{chunk} is not allocated"))]
    NotAllocated {
        addr: usize,
        chunk: usize,
        index: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl InvalidPointer {
    /// The rejected address.
    #[must_use]
    pub fn addr(&self) -> usize {
        match self {
            Self::Foreign { addr, .. }
            | Self::Misaligned { addr, .. }
            | Self::NotAllocated { addr, .. } => *addr,
        }
    }
}
