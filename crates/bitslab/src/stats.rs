//! Occupancy snapshots.

use core::fmt;

/// Occupancy of a [`SlabAllocator`](crate::SlabAllocator) at one point in
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    /// Number of chunks linked into the pool.
    pub chunks: usize,
    /// Number of blocks currently handed out.
    pub used_blocks: usize,
    /// Total number of blocks across all chunks.
    pub capacity_blocks: usize,
    pub block_size: usize,
    pub chunk_size: usize,
}

impl SlabStats {
    #[must_use]
    pub const fn free_blocks(&self) -> usize {
        self.capacity_blocks - self.used_blocks
    }

    /// Bytes reserved from the backend for chunk regions.
    #[must_use]
    pub const fn reserved_bytes(&self) -> usize {
        self.chunks * self.chunk_size
    }
}

impl fmt::Display for SlabStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} blocks of {} bytes in use, {} chunk(s) of {} bytes reserved",
            self.used_blocks, self.capacity_blocks, self.block_size, self.chunks, self.chunk_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::string::ToString as _;

    use super::*;

    #[test]
    fn test_derived_counts() {
        let stats = SlabStats {
            chunks: 2,
            used_blocks: 100,
            capacity_blocks: 128,
            block_size: 64,
            chunk_size: 4096,
        };
        assert_eq!(stats.free_blocks(), 28);
        assert_eq!(stats.reserved_bytes(), 8192);
        assert_eq!(
            stats.to_string(),
            "100/128 blocks of 64 bytes in use, 2 chunk(s) of 4096 bytes reserved"
        );
    }
}
