//! A concurrent fixed-size block allocator.
//!
//! `bitslab` serves equal-sized allocation requests from large, coarsely
//! reserved memory regions called *chunks*. Each chunk is divided into blocks
//! of the same size, and an atomic bitmap records which blocks are in use.
//! It is meant as a building block beneath a general-purpose allocator or an
//! object pool, not as a variable-size heap.
//!
//! # Structure
//!
//! ```text
//!   SlabAllocator
//!   ├── head ──▶ Chunk #n ──▶ Chunk #n-1 ──▶ ... ──▶ Chunk #0
//!   │            ┌───────────────────────────────────────────┐
//!   │            │ bitmap: [AtomicU64; chunk_size/block/64]  │
//!   │            │ memory: chunk_size bytes from the backend │
//!   │            └───────────────────────────────────────────┘
//!   └── free lock (global or per chunk)
//! ```
//!
//! - [`SlabAllocator::allocate`] is lock-free while any chunk has a free
//!   block, and grows the pool by one chunk when every chunk is full.
//! - [`SlabAllocator::deallocate`] clears the block's bit under a lock. It
//!   rejects foreign, misaligned and already-free pointers without touching
//!   any state.
//! - [`SlabAllocator::cleanup`] returns every chunk to the backend.
//!
//! # Usage
//!
//! ```rust
//! use bitslab::{FreeLocking, HeapBackend, SlabAllocator, SlabConfig};
//!
//! // 64-byte blocks in 4 MiB chunks, memory from the operating system
//! let allocator = SlabAllocator::new();
//! let block = allocator.allocate().unwrap();
//! unsafe {
//!     block.write_bytes(0xab, allocator.config().block_size());
//! }
//! allocator.deallocate(block.as_ptr()).unwrap();
//!
//! // custom geometry and backend
//! let config = SlabConfig::new(256, 1024 * 1024)
//!     .unwrap()
//!     .with_free_locking(FreeLocking::PerChunk);
//! let allocator = SlabAllocator::with_config(config, HeapBackend);
//! let block = allocator.allocate().unwrap();
//! assert_eq!(allocator.stats().used_blocks, 1);
//! allocator.deallocate(block.as_ptr()).unwrap();
//! ```
//!
//! # Thread Safety
//!
//! [`SlabAllocator`] is `Send` and `Sync`. Any number of threads may
//! allocate and deallocate through a shared reference.
//!
//! # Logging
//!
//! Diagnostics go through the [`log`] facade. Growth and cleanup are logged
//! at `debug`, rejected deallocations at `warn`.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod backing;
mod bitmap;
mod chunk;
pub mod config;
pub mod error;
mod slab;
mod stats;

#[cfg(unix)]
pub use self::backing::MmapBackend;
pub use self::{
    backing::{HeapBackend, MemoryBackend, ReserveError, SystemBackend},
    config::{BLOCK_SIZE, BLOCKS_PER_CHUNK, CHUNK_SIZE, ConfigError, FreeLocking, SlabConfig},
    error::{AllocError, InvalidPointer},
    slab::SlabAllocator,
    stats::SlabStats,
};
