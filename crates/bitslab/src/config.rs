//! Pool geometry and locking policy.
//!
//! The geometry of a pool is fixed by two numbers: the size of a block and the
//! size of a chunk. Everything else (blocks per chunk, bitmap words per chunk)
//! is derived from them. The reference sizing is 64-byte blocks carved out of
//! 4 MiB chunks, which gives 65536 blocks and 1024 bitmap words per chunk.

use snafu::{Snafu, ensure};

use crate::error::Location;

/// Size in bytes of a single block handed out by the allocator.
pub const BLOCK_SIZE: usize = 64;

/// Size in bytes of the memory region backing a single chunk.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Number of blocks tracked by one bitmap word.
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of blocks in a chunk of the default geometry.
pub const BLOCKS_PER_CHUNK: usize = CHUNK_SIZE / BLOCK_SIZE;

/// Number of bitmap words in a chunk of the default geometry.
pub const BITMAP_WORDS: usize = BLOCKS_PER_CHUNK / BITS_PER_WORD;

const _: () = assert!(CHUNK_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(BLOCKS_PER_CHUNK % BITS_PER_WORD == 0);

/// How `deallocate` serializes against other deallocations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FreeLocking {
    /// One allocator-wide lock.
    ///
    /// Every deallocation in the process goes through the same lock, which
    /// makes it the throughput bottleneck of the pool when many threads free
    /// blocks at once.
    #[default]
    Global,
    /// One lock per chunk, taken after the owning chunk has been located.
    PerChunk,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("block size must not be zero"))]
    ZeroBlockSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("chunk size {chunk_size} is not a multiple of block size {block_size}"))]
    NotMultiple {
        block_size: usize,
        chunk_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("chunk of {blocks} blocks cannot be tracked by whole 64-bit bitmap words"))]
    BadGranularity {
        blocks: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Geometry and policy of a [`SlabAllocator`](crate::SlabAllocator).
///
/// A valid configuration satisfies:
///
/// - `block_size > 0`
/// - `chunk_size` is an exact multiple of `block_size`
/// - the number of blocks per chunk is a non-zero multiple of
///   [`BITS_PER_WORD`], so that every bitmap word is fully used
///
/// # Examples
///
/// ```
/// use bitslab::{FreeLocking, SlabConfig};
///
/// let config = SlabConfig::new(128, 1024 * 1024)
///     .unwrap()
///     .with_free_locking(FreeLocking::PerChunk);
/// assert_eq!(config.blocks_per_chunk(), 8192);
/// assert_eq!(config.bitmap_words(), 128);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    block_size: usize,
    chunk_size: usize,
    free_locking: FreeLocking,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl SlabConfig {
    /// 64-byte blocks in 4 MiB chunks, with a global free lock.
    pub const DEFAULT: Self = Self {
        block_size: BLOCK_SIZE,
        chunk_size: CHUNK_SIZE,
        free_locking: FreeLocking::Global,
    };

    /// Creates a configuration with the given geometry.
    ///
    /// The free locking policy defaults to [`FreeLocking::Global`].
    pub fn new(block_size: usize, chunk_size: usize) -> Result<Self, ConfigError> {
        ensure!(block_size > 0, ZeroBlockSizeSnafu);
        ensure!(
            chunk_size.is_multiple_of(block_size),
            NotMultipleSnafu {
                block_size,
                chunk_size,
            }
        );
        let blocks = chunk_size / block_size;
        ensure!(
            blocks > 0 && blocks.is_multiple_of(BITS_PER_WORD),
            BadGranularitySnafu { blocks }
        );
        Ok(Self {
            block_size,
            chunk_size,
            free_locking: FreeLocking::Global,
        })
    }

    #[must_use]
    pub const fn with_free_locking(mut self, free_locking: FreeLocking) -> Self {
        self.free_locking = free_locking;
        self
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub const fn free_locking(&self) -> FreeLocking {
        self.free_locking
    }

    #[must_use]
    pub const fn blocks_per_chunk(&self) -> usize {
        self.chunk_size / self.block_size
    }

    #[must_use]
    pub const fn bitmap_words(&self) -> usize {
        self.blocks_per_chunk() / BITS_PER_WORD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = SlabConfig::default();
        assert_eq!(config.block_size(), 64);
        assert_eq!(config.chunk_size(), 4 * 1024 * 1024);
        assert_eq!(config.blocks_per_chunk(), 65536);
        assert_eq!(config.bitmap_words(), 1024);
        assert_eq!(config.free_locking(), FreeLocking::Global);
    }

    #[test]
    fn test_custom_geometry() {
        let config = SlabConfig::new(32, 64 * 32).unwrap();
        assert_eq!(config.blocks_per_chunk(), 64);
        assert_eq!(config.bitmap_words(), 1);

        let config = SlabConfig::new(48, 48 * 128).unwrap();
        assert_eq!(config.blocks_per_chunk(), 128);
        assert_eq!(config.bitmap_words(), 2);
    }

    #[test]
    fn test_zero_block_size() {
        assert!(matches!(
            SlabConfig::new(0, CHUNK_SIZE),
            Err(ConfigError::ZeroBlockSize { .. })
        ));
    }

    #[test]
    fn test_chunk_not_multiple_of_block() {
        assert!(matches!(
            SlabConfig::new(64, 64 * 64 + 1),
            Err(ConfigError::NotMultiple {
                block_size: 64,
                chunk_size: 4097,
                ..
            })
        ));
    }

    #[test]
    fn test_partial_bitmap_word() {
        assert!(matches!(
            SlabConfig::new(64, 64 * 32),
            Err(ConfigError::BadGranularity { blocks: 32, .. })
        ));
        assert!(matches!(
            SlabConfig::new(64, 0),
            Err(ConfigError::BadGranularity { blocks: 0, .. })
        ));
    }

    #[test]
    fn test_with_free_locking() {
        let config = SlabConfig::DEFAULT.with_free_locking(FreeLocking::PerChunk);
        assert_eq!(config.free_locking(), FreeLocking::PerChunk);
        assert_eq!(config.blocks_per_chunk(), BLOCKS_PER_CHUNK);
    }
}
