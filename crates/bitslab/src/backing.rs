//! Raw memory backing for chunks.
//!
//! The allocator never talks to the operating system directly. It reserves
//! and releases whole chunk regions through a [`MemoryBackend`], which keeps
//! the engine independent from the actual source of memory (anonymous
//! mappings, the global heap, a test double that runs out on purpose, ...).

use core::{alloc::Layout, ptr::NonNull};

use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::error::Location;

/// Alignment guaranteed for every region returned by the built-in backends.
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReserveError {
    #[snafu(display("mmap of {size} bytes failed"))]
    Mmap {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot describe a {size}-byte region as a layout"))]
    Layout {
        size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: core::alloc::LayoutError,
    },
    #[snafu(display("heap allocation of {size} bytes failed"))]
    Heap {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("backing memory exhausted while reserving {size} bytes"))]
    Exhausted {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Source of the large regions that chunks are carved from.
///
/// # Safety
///
/// Implementors must guarantee that a region returned by
/// [`reserve`](Self::reserve):
///
/// - is valid for reads and writes of `size` bytes
/// - is zero-filled
/// - is aligned to at least [`PAGE_SIZE`]
/// - does not overlap any other live region
/// - stays valid until it is passed to [`release`](Self::release)
pub unsafe trait MemoryBackend: Send + Sync {
    /// Reserves and commits `size` zero-initialized bytes.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, ReserveError>;

    /// Returns a region obtained from [`reserve`](Self::reserve).
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must describe a region returned by `reserve` on this
    /// backend, and the region must not be released twice.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);
}

/// Anonymous private memory mappings.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBackend;

#[cfg(unix)]
unsafe impl MemoryBackend for MmapBackend {
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, ReserveError> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return MmapSnafu { size }.fail();
        }
        NonNull::new(ptr.cast()).context(MmapSnafu { size })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        let res = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
        if res != 0 {
            log::warn!("munmap of {size} bytes at {ptr:p} failed");
        }
    }
}

/// Page-aligned zeroed allocations from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBackend;

fn region_layout(size: usize) -> Result<Layout, ReserveError> {
    Layout::from_size_align(size, PAGE_SIZE).context(LayoutSnafu { size })
}

unsafe impl MemoryBackend for HeapBackend {
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, ReserveError> {
        let layout = region_layout(size)?;
        if layout.size() == 0 {
            return HeapSnafu { size }.fail();
        }
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).context(HeapSnafu { size })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        match region_layout(size) {
            Ok(layout) => unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) },
            Err(err) => log::warn!("cannot release {size} bytes at {ptr:p}: {err}"),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// The backend used by [`SlabAllocator::new`](crate::SlabAllocator::new).
        pub type SystemBackend = MmapBackend;
    } else {
        /// The backend used by [`SlabAllocator::new`](crate::SlabAllocator::new).
        pub type SystemBackend = HeapBackend;
    }
}
