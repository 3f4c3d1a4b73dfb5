//! A chunk: one large backing region split into equal-sized blocks.

use core::ptr::NonNull;

use snafu::ResultExt as _;

use crate::{
    backing::MemoryBackend,
    bitmap::AtomicBitmap,
    config::SlabConfig,
    error::{AllocError, OutOfMemorySnafu},
};

/// Position of a block inside a chunk, as computed by
/// [`Chunk::block_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOffset {
    Aligned(usize),
    Misaligned(usize),
}

/// One backing region of `chunk_size` bytes and its occupancy bitmap.
///
/// Chunks form an intrusive stack through `next`, newest first. A chunk is
/// published once and stays linked until the whole allocator is torn down;
/// `base`, the geometry and `next` never change after publication.
pub(crate) struct Chunk {
    base: NonNull<u8>,
    config: SlabConfig,
    bitmap: AtomicBitmap,
    next: *mut Chunk,
    serial: usize,
    free_lock: spin::Mutex<()>,
    released: bool,
}

// `base` is only dereferenced by the owner of a claimed block, and `next` is
// written before the chunk becomes visible to other threads.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Reserves a new, completely free chunk.
    ///
    /// Nothing is left behind if the backend cannot provide the region.
    pub(crate) fn new<B>(backend: &B, config: SlabConfig, serial: usize) -> Result<Self, AllocError>
    where
        B: MemoryBackend,
    {
        let size = config.chunk_size();
        let base = backend.reserve(size).context(OutOfMemorySnafu { size })?;
        Ok(Self {
            base,
            config,
            bitmap: AtomicBitmap::new(config.bitmap_words()),
            next: core::ptr::null_mut(),
            serial,
            free_lock: spin::Mutex::new(()),
            released: false,
        })
    }

    /// Returns the backing region to `backend`.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Safety
    ///
    /// `backend` must be the backend the chunk was created with, and no
    /// block of this chunk may be accessed afterwards.
    pub(crate) unsafe fn release<B>(&mut self, backend: &B)
    where
        B: MemoryBackend,
    {
        if self.released {
            return;
        }
        self.released = true;
        unsafe {
            backend.release(self.base, self.config.chunk_size());
        }
    }

    pub(crate) fn serial(&self) -> usize {
        self.serial
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base.addr().get()
    }

    pub(crate) fn next(&self) -> *mut Self {
        self.next
    }

    /// Links this chunk on top of `head`.
    ///
    /// Only called while the chunk is still private to the growing thread.
    pub(crate) fn set_next(&mut self, head: *mut Self) {
        self.next = head;
    }

    pub(crate) fn free_lock(&self) -> &spin::Mutex<()> {
        &self.free_lock
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();
        (base..base + self.config.chunk_size()).contains(&addr)
    }

    /// Maps an address inside this chunk to its block index.
    pub(crate) fn block_index(&self, addr: usize) -> BlockOffset {
        debug_assert!(self.contains(addr));
        let offset = addr - self.base_addr();
        if offset.is_multiple_of(self.config.block_size()) {
            BlockOffset::Aligned(offset / self.config.block_size())
        } else {
            BlockOffset::Misaligned(offset)
        }
    }

    pub(crate) fn block_ptr(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.bitmap.len());
        unsafe { self.base.add(index * self.config.block_size()) }
    }

    /// See [`AtomicBitmap::find_first_free`].
    pub(crate) fn find_first_free_block(&self) -> Option<(usize, u64)> {
        self.bitmap.find_first_free()
    }

    /// Scans this chunk and claims the first free block, rescanning whenever
    /// a claim loses a race.
    ///
    /// Returns `None` once the chunk is observed full.
    pub(crate) fn claim_any(&self) -> Option<NonNull<u8>> {
        loop {
            let (index, observed) = self.find_first_free_block()?;
            if self.bitmap.try_claim(index, observed) {
                log::trace!("claimed block {index} of chunk #{}", self.serial);
                return Some(self.block_ptr(index));
            }
        }
    }

    /// Claims block 0 of a chunk that has just been published.
    ///
    /// Fails if any other thread already claimed a block of its first word.
    pub(crate) fn claim_first(&self) -> Option<NonNull<u8>> {
        self.bitmap.try_claim(0, 0).then(|| self.block_ptr(0))
    }

    /// Clears the bit of block `index`, returning whether it was set.
    pub(crate) fn release_block(&self, index: usize) -> bool {
        self.bitmap.release(index)
    }

    pub(crate) fn is_allocated(&self, index: usize) -> bool {
        self.bitmap.is_set(index)
    }

    pub(crate) fn used_blocks(&self) -> usize {
        self.bitmap.count_used()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "chunk #{} dropped without releasing its memory, leaking {} bytes",
                self.serial,
                self.config.chunk_size()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::HeapBackend;

    fn small_config() -> SlabConfig {
        SlabConfig::new(64, 64 * 128).unwrap()
    }

    fn with_chunk<F>(test_fn: F)
    where
        F: FnOnce(&Chunk),
    {
        let backend = HeapBackend;
        let mut chunk = Chunk::new(&backend, small_config(), 0).unwrap();
        test_fn(&chunk);
        unsafe {
            chunk.release(&backend);
        }
    }

    #[test]
    fn test_new_chunk_is_free() {
        with_chunk(|chunk| {
            assert_eq!(chunk.used_blocks(), 0);
            assert!(chunk.next().is_null());
            assert_eq!(chunk.find_first_free_block(), Some((0, 0)));
        });
    }

    #[test]
    fn test_claim_any_is_ordered() {
        with_chunk(|chunk| {
            for i in 0..128 {
                let ptr = chunk.claim_any().unwrap();
                assert_eq!(ptr.addr().get(), chunk.base_addr() + i * 64);
            }
            assert!(chunk.claim_any().is_none());
            assert_eq!(chunk.used_blocks(), 128);
        });
    }

    #[test]
    fn test_claim_first() {
        with_chunk(|chunk| {
            let ptr = chunk.claim_first().unwrap();
            assert_eq!(ptr.addr().get(), chunk.base_addr());
            assert!(chunk.claim_first().is_none());
            assert!(chunk.is_allocated(0));
        });
    }

    #[test]
    fn test_contains_and_block_index() {
        with_chunk(|chunk| {
            let base = chunk.base_addr();
            assert!(!chunk.contains(base - 1));
            assert!(chunk.contains(base));
            assert!(chunk.contains(base + 64 * 128 - 1));
            assert!(!chunk.contains(base + 64 * 128));

            assert_eq!(chunk.block_index(base), BlockOffset::Aligned(0));
            assert_eq!(chunk.block_index(base + 64 * 5), BlockOffset::Aligned(5));
            assert_eq!(chunk.block_index(base + 65), BlockOffset::Misaligned(65));
        });
    }

    #[test]
    fn test_release_block() {
        with_chunk(|chunk| {
            let first = chunk.claim_any().unwrap();
            let _second = chunk.claim_any().unwrap();
            assert!(chunk.release_block(0));
            assert!(!chunk.release_block(0));
            assert_eq!(chunk.claim_any(), Some(first));
        });
    }

    #[test]
    fn test_release_is_idempotent() {
        let backend = HeapBackend;
        let mut chunk = Chunk::new(&backend, small_config(), 3).unwrap();
        assert_eq!(chunk.serial(), 3);
        unsafe {
            chunk.release(&backend);
            chunk.release(&backend);
        }
    }
}
