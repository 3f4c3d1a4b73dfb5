//! Occupancy bitmap of a chunk.
//!
//! One bit per block, packed into 64-bit words. A set bit means the block is
//! in use. Every word is an independent atomic unit: claims are a single
//! compare-and-set on one word, releases a single `fetch_and` on one word.
//! Nothing is atomic across words.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::BITS_PER_WORD;

const FULL: u64 = u64::MAX;

fn split(index: usize) -> (usize, u64) {
    (index / BITS_PER_WORD, 1 << (index % BITS_PER_WORD))
}

pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
}

impl AtomicBitmap {
    /// Creates a bitmap of `words` words with every block free.
    pub(crate) fn new(words: usize) -> Self {
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.words.len() * BITS_PER_WORD
    }

    /// Finds the lowest-indexed free block.
    ///
    /// Words are scanned from index 0 upward; within the first word that is
    /// not full, the lowest zero bit wins. Returns the block index together
    /// with the word value it was observed in, which is the expected value
    /// for a subsequent [`try_claim`](Self::try_claim).
    pub(crate) fn find_first_free(&self) -> Option<(usize, u64)> {
        self.words.iter().enumerate().find_map(|(i, word)| {
            let value = word.load(Ordering::Relaxed);
            (value != FULL).then(|| (i * BITS_PER_WORD + value.trailing_ones() as usize, value))
        })
    }

    /// Attempts to set the bit of `index`, assuming its word still holds
    /// `observed`.
    ///
    /// Fails if any bit of the word changed since it was observed, even a
    /// bit unrelated to `index`.
    pub(crate) fn try_claim(&self, index: usize, observed: u64) -> bool {
        let (word, bit) = split(index);
        debug_assert_eq!(observed & bit, 0);
        self.words[word]
            .compare_exchange(observed, observed | bit, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Clears the bit of `index`.
    ///
    /// Returns `false`, leaving the word untouched, if the bit was already
    /// clear.
    pub(crate) fn release(&self, index: usize) -> bool {
        let (word, bit) = split(index);
        let previous = self.words[word].fetch_and(!bit, Ordering::AcqRel);
        previous & bit != 0
    }

    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word, bit) = split(index);
        self.words[word].load(Ordering::Acquire) & bit != 0
    }

    pub(crate) fn count_used(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_next(bitmap: &AtomicBitmap) -> Option<usize> {
        let (index, observed) = bitmap.find_first_free()?;
        assert!(bitmap.try_claim(index, observed));
        Some(index)
    }

    #[test]
    fn test_empty_bitmap() {
        let bitmap = AtomicBitmap::new(4);
        assert_eq!(bitmap.len(), 256);
        assert_eq!(bitmap.find_first_free(), Some((0, 0)));
        assert_eq!(bitmap.count_used(), 0);
    }

    #[test]
    fn test_sequential_claims() {
        let bitmap = AtomicBitmap::new(2);
        for expected in 0..128 {
            assert_eq!(claim_next(&bitmap), Some(expected));
        }
        assert_eq!(bitmap.find_first_free(), None);
        assert_eq!(bitmap.count_used(), 128);
    }

    #[test]
    fn test_lowest_free_wins() {
        let bitmap = AtomicBitmap::new(3);
        for _ in 0..150 {
            claim_next(&bitmap).unwrap();
        }
        assert!(bitmap.release(130));
        assert!(bitmap.release(70));
        assert!(bitmap.release(5));

        assert_eq!(claim_next(&bitmap), Some(5));
        assert_eq!(claim_next(&bitmap), Some(70));
        assert_eq!(claim_next(&bitmap), Some(130));
        assert_eq!(claim_next(&bitmap), Some(150));
    }

    #[test]
    fn test_stale_observation_fails() {
        let bitmap = AtomicBitmap::new(1);
        let (index, observed) = bitmap.find_first_free().unwrap();
        assert_eq!(index, 0);

        // another claimer takes an unrelated bit in the same word
        assert!(bitmap.try_claim(7, observed));

        assert!(!bitmap.try_claim(index, observed));
        assert!(!bitmap.is_set(index));
        assert_eq!(bitmap.find_first_free(), Some((0, 1 << 7)));
    }

    #[test]
    fn test_release_reports_previous_state() {
        let bitmap = AtomicBitmap::new(1);
        assert!(!bitmap.release(3));
        assert_eq!(bitmap.count_used(), 0);

        claim_next(&bitmap).unwrap();
        assert!(bitmap.is_set(0));
        assert!(bitmap.release(0));
        assert!(!bitmap.release(0));
        assert!(!bitmap.is_set(0));
    }

    #[test]
    fn test_release_keeps_neighbours() {
        let bitmap = AtomicBitmap::new(1);
        for _ in 0..3 {
            claim_next(&bitmap).unwrap();
        }
        assert!(bitmap.release(1));
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(2));
        assert_eq!(bitmap.count_used(), 2);
    }
}
