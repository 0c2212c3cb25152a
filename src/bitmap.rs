//! Atomic per-packet bitmaps.
//!
//! Both engines track packet state as one bit per index: the sender's
//! acknowledgement bitmap and the receiver's first-arrival bitmap. Bits are
//! set with `fetch_or`, so concurrent setters agree on exactly one winner
//! and duplicates are naturally idempotent.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u32 = 64;

pub(crate) struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    bits: u32,
}

impl AtomicBitmap {
    pub(crate) fn new(bits: u32) -> Self {
        let words = (bits + WORD_BITS - 1) / WORD_BITS;
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    /// Sets bit `bit`, returning whether this call was the first to set it
    pub(crate) fn set(&self, bit: u32) -> bool {
        debug_assert!(bit < self.bits);
        let mask = 1 << (bit % WORD_BITS);
        let prev = self.words[(bit / WORD_BITS) as usize].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    pub(crate) fn get(&self, bit: u32) -> bool {
        debug_assert!(bit < self.bits);
        let mask = 1 << (bit % WORD_BITS);
        self.words[(bit / WORD_BITS) as usize].load(Ordering::Acquire) & mask != 0
    }

    /// Copies the window `[first, first + count)` into little-endian bytes
    ///
    /// `first` must be word-aligned; windows produced by the comm cadence
    /// always are. The snapshot is not atomic across words, which only makes
    /// an acknowledgement conservative, never wrong: bits can be missing
    /// from the snapshot, not invented.
    pub(crate) fn snapshot_bytes(&self, first: u32, count: u32) -> Vec<u8> {
        debug_assert_eq!(first % WORD_BITS, 0);
        debug_assert!(first + count <= self.bits);
        let mut out = Vec::with_capacity(((count + 7) / 8) as usize);
        let first_word = (first / WORD_BITS) as usize;
        let last_word = ((first + count + WORD_BITS - 1) / WORD_BITS) as usize;
        for word in &self.words[first_word..last_word.min(self.words.len())] {
            out.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        out.truncate(((count + 7) / 8) as usize);
        out
    }
}
