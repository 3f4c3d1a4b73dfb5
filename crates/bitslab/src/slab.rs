//! The slab allocator.
//!
//! A [`SlabAllocator`] hands out fixed-size blocks carved from a stack of
//! chunks, newest chunk first. Allocation is lock-free while any chunk still
//! has a free block; the pool grows by one chunk only when every existing
//! chunk is observed full.
//!
//! # Allocation
//!
//! 1. Load the head of the chunk stack.
//! 2. Walk the stack from the head toward the oldest chunk. In each chunk,
//!    find the lowest free block and claim it with a compare-and-set on its
//!    bitmap word. A lost race rescans the same chunk; a full chunk moves the
//!    walk on.
//! 3. If every chunk is full, reserve a new chunk and publish it as the new
//!    head with a compare-and-set against the head loaded in step 1. If
//!    another thread published first, the fresh chunk is released and the
//!    procedure restarts from step 1, where the winner's chunk is visible.
//! 4. After a successful publish, claim block 0 of the new chunk. If another
//!    thread got there first, restart from step 1.
//!
//! ```text
//!   head
//!    │
//!    ▼
//!  ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//!  │ chunk #2 │─────▶│ chunk #1 │─────▶│ chunk #0 │─────▶ null
//!  └──────────┘      └──────────┘      └──────────┘
//!   newest                              oldest
//! ```
//!
//! # Deallocation
//!
//! Deallocation locates the chunk whose address range contains the pointer
//! and clears its bit with an atomic `fetch_and`, so that a concurrent claim
//! of another block in the same word is never lost. Deallocations are
//! serialized against each other by a lock, either allocator-wide or per
//! chunk depending on [`FreeLocking`]. With the default global lock, every
//! deallocation in the process contends on a single lock: this is the
//! throughput bottleneck of the pool.
//!
//! # Teardown
//!
//! [`SlabAllocator::cleanup`] takes `&mut self`, so no allocation or
//! deallocation can be in flight while chunks are released.

use alloc::boxed::Box;
use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use snafu::{OptionExt as _, ensure};

use crate::{
    backing::{MemoryBackend, SystemBackend},
    chunk::{BlockOffset, Chunk},
    config::{FreeLocking, SlabConfig},
    error::{AllocError, ForeignSnafu, InvalidPointer, MisalignedSnafu, NotAllocatedSnafu},
    stats::SlabStats,
};

/// A concurrent allocator of fixed-size blocks.
///
/// # Examples
///
/// ```
/// use bitslab::SlabAllocator;
///
/// let allocator = SlabAllocator::new();
///
/// let p1 = allocator.allocate().unwrap();
/// allocator.deallocate(p1.as_ptr()).unwrap();
///
/// // the block just freed is handed out again
/// let p2 = allocator.allocate().unwrap();
/// assert_eq!(p1, p2);
/// ```
pub struct SlabAllocator<B = SystemBackend>
where
    B: MemoryBackend,
{
    head: AtomicPtr<Chunk>,
    free_lock: spin::Mutex<()>,
    config: SlabConfig,
    backend: B,
    _chunks: PhantomData<Box<Chunk>>,
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    /// Creates an empty allocator with the default geometry, backed by the
    /// operating system.
    ///
    /// No memory is reserved until the first allocation.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SlabConfig::DEFAULT, SystemBackend::default())
    }
}

impl<B> SlabAllocator<B>
where
    B: MemoryBackend,
{
    /// Creates an empty allocator with the given geometry and backend.
    #[must_use]
    pub const fn with_config(config: SlabConfig, backend: B) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            free_lock: spin::Mutex::new(()),
            config,
            backend,
            _chunks: PhantomData,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SlabConfig {
        &self.config
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    fn chunks(&self) -> Chunks<'_> {
        Chunks::new(self.head.load(Ordering::Acquire))
    }

    /// Allocates one block.
    ///
    /// The returned block is `block_size` bytes long, lies at a multiple of
    /// `block_size` from the base of its chunk, and is exclusively owned by
    /// the caller until it is passed to [`deallocate`](Self::deallocate).
    /// Its contents are unspecified, except for blocks of a fresh chunk,
    /// which are zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if every chunk is full and the
    /// backend cannot provide a new one.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if let Some(block) = Chunks::new(head).find_map(Chunk::claim_any) {
                return Ok(block);
            }

            if let Some(chunk) = self.grow(head)? {
                if let Some(block) = chunk.claim_first() {
                    return Ok(block);
                }
                log::debug!("block 0 of fresh chunk #{} was taken, rescanning", chunk.serial());
            }
        }
    }

    /// Reserves a chunk and publishes it on top of `head`.
    ///
    /// Returns `None` if the head moved since it was observed full, in which
    /// case the reserved chunk is released again.
    fn grow(&self, head: *mut Chunk) -> Result<Option<&Chunk>, AllocError> {
        let serial = unsafe { head.as_ref() }.map_or(0, |chunk| chunk.serial() + 1);
        let mut chunk = Box::new(Chunk::new(&self.backend, self.config, serial)?);
        chunk.set_next(head);
        let chunk = Box::into_raw(chunk);

        match self
            .head
            .compare_exchange(head, chunk, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let chunk = unsafe { &*chunk };
                log::debug!(
                    "grew pool with chunk #{} at {:#x} ({} blocks of {} bytes)",
                    chunk.serial(),
                    chunk.base_addr(),
                    self.config.blocks_per_chunk(),
                    self.config.block_size(),
                );
                Ok(Some(chunk))
            }
            Err(_) => {
                let mut chunk = unsafe { Box::from_raw(chunk) };
                unsafe {
                    chunk.release(&self.backend);
                }
                log::debug!("lost the race to publish chunk #{serial}, released it");
                Ok(None)
            }
        }
    }

    /// Returns a block to the pool.
    ///
    /// A null pointer is accepted and ignored. After a successful call the
    /// block may be handed out again by [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidPointer`] if `ptr` does not lie in any chunk of
    /// this allocator, is not on a block boundary, or designates a block that
    /// is not currently allocated. The rejection is also logged as a
    /// warning. In every such case no state is modified.
    pub fn deallocate(&self, ptr: *mut u8) -> Result<(), InvalidPointer> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let addr = ptr.addr().get();

        let result = match self.config.free_locking() {
            FreeLocking::Global => {
                let _guard = self.free_lock.lock();
                self.free_block(addr, false)
            }
            FreeLocking::PerChunk => self.free_block(addr, true),
        };
        if let Err(err) = &result {
            log::warn!("rejected deallocation: {err}");
        }
        result
    }

    fn free_block(&self, addr: usize, lock_chunk: bool) -> Result<(), InvalidPointer> {
        let chunk = self
            .chunks()
            .find(|chunk| chunk.contains(addr))
            .context(ForeignSnafu { addr })?;
        let _guard = lock_chunk.then(|| chunk.free_lock().lock());

        let index = match chunk.block_index(addr) {
            BlockOffset::Aligned(index) => index,
            BlockOffset::Misaligned(offset) => {
                return MisalignedSnafu {
                    addr,
                    chunk: chunk.serial(),
                    offset,
                    block_size: self.config.block_size(),
                }
                .fail();
            }
        };
        ensure!(
            chunk.release_block(index),
            NotAllocatedSnafu {
                addr,
                chunk: chunk.serial(),
                index,
            }
        );
        Ok(())
    }

    /// Returns `true` if `ptr` is the start of a block of this allocator that
    /// is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        self.chunks()
            .find(|chunk| chunk.contains(addr))
            .is_some_and(|chunk| match chunk.block_index(addr) {
                BlockOffset::Aligned(index) => chunk.is_allocated(index),
                BlockOffset::Misaligned(_) => false,
            })
    }

    /// Number of chunks currently linked into the pool.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks().next().map_or(0, |head| head.serial() + 1)
    }

    /// Takes a snapshot of the pool occupancy.
    ///
    /// Under concurrent use the counts are only approximate: each bitmap
    /// word is read independently.
    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let (chunks, used_blocks) = self
            .chunks()
            .fold((0, 0), |(chunks, used), chunk| (chunks + 1, used + chunk.used_blocks()));
        SlabStats {
            chunks,
            used_blocks,
            capacity_blocks: chunks * self.config.blocks_per_chunk(),
            block_size: self.config.block_size(),
            chunk_size: self.config.chunk_size(),
        }
    }

    /// Releases every chunk back to the backend.
    ///
    /// All blocks handed out so far become invalid. The allocator stays
    /// usable and grows again on the next allocation. Calling this more than
    /// once is harmless; it is also called when the allocator is dropped.
    pub fn cleanup(&mut self) {
        let mut current = core::mem::replace(self.head.get_mut(), ptr::null_mut());
        let mut released = 0_usize;
        while !current.is_null() {
            let mut chunk = unsafe { Box::from_raw(current) };
            current = chunk.next();
            unsafe {
                chunk.release(&self.backend);
            }
            released += 1;
        }
        if released > 0 {
            log::debug!("released {released} chunk(s)");
        }
    }
}

impl<B> Drop for SlabAllocator<B>
where
    B: MemoryBackend,
{
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl<B> fmt::Debug for SlabAllocator<B>
where
    B: MemoryBackend,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Walks the chunk stack from a given head toward the oldest chunk.
struct Chunks<'a> {
    current: *mut Chunk,
    _allocator: PhantomData<&'a Chunk>,
}

impl Chunks<'_> {
    fn new(head: *mut Chunk) -> Self {
        Self {
            current: head,
            _allocator: PhantomData,
        }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        // Published chunks live until `cleanup`, which needs `&mut` access to
        // the allocator this iterator borrows from.
        let chunk = unsafe { self.current.as_ref()? };
        self.current = chunk.next();
        Some(chunk)
    }
}
