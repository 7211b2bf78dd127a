//! Growable bitset whose bits can be read and written from many threads.
//!
//! Bits live in a vector of `AtomicU64` words. Individual bit operations only
//! take the read side of the lock and then act on a single word atomically;
//! the write side is taken only when the vector has to grow.

use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u32 = u64::BITS;

/// Concurrent bit-indexed membership set
#[derive(Debug, Default)]
pub struct ConcurrentBitSet {
    words: RwLock<Vec<AtomicU64>>,
}

impl ConcurrentBitSet {
    /// Create an empty bitset
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bitset with room for `bits` bits before it has to grow
    pub fn with_capacity(bits: u32) -> Self {
        let len = bits.div_ceil(WORD_BITS) as usize;
        Self {
            words: RwLock::new((0..len).map(|_| AtomicU64::new(0)).collect()),
        }
    }

    #[inline]
    fn locate(bit: u32) -> (usize, u64) {
        ((bit / WORD_BITS) as usize, 1u64 << (bit % WORD_BITS))
    }

    /// Check whether a bit is set
    pub fn get(&self, bit: u32) -> bool {
        let (word, mask) = Self::locate(bit);
        self.words
            .read()
            .get(word)
            .is_some_and(|w| w.load(Ordering::Acquire) & mask != 0)
    }

    /// Set a bit, returning whether it was already set
    ///
    /// Concurrent calls for the same bit are harmless: exactly one of them
    /// observes `false`, and the bit ends up set either way.
    pub fn set(&self, bit: u32) -> bool {
        let (word, mask) = Self::locate(bit);

        {
            let words = self.words.read();
            if let Some(w) = words.get(word) {
                return w.fetch_or(mask, Ordering::AcqRel) & mask != 0;
            }
        }

        let mut words = self.words.write();
        if words.len() <= word {
            let new_len = (word + 1).next_power_of_two();
            words.resize_with(new_len, || AtomicU64::new(0));
        }
        words[word].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clear a bit, returning whether it was set
    pub fn clear(&self, bit: u32) -> bool {
        let (word, mask) = Self::locate(bit);
        self.words
            .read()
            .get(word)
            .is_some_and(|w| w.fetch_and(!mask, Ordering::AcqRel) & mask != 0)
    }

    /// Number of set bits
    pub fn cardinality(&self) -> u64 {
        self.words
            .read()
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words
            .read()
            .iter()
            .all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// Collect the set bits in ascending order
    ///
    /// Taken word by word, so bits flipped concurrently may or may not show up.
    pub fn iter(&self) -> impl Iterator<Item = u32> {
        let words = self.words.read();
        let mut bits = Vec::new();

        for (idx, word) in words.iter().enumerate() {
            let mut value = word.load(Ordering::Acquire);
            while value != 0 {
                let offset = value.trailing_zeros();
                bits.push(idx as u32 * WORD_BITS + offset);
                value &= value - 1;
            }
        }

        bits.into_iter()
    }

    /// Copy the set bits into a roaring bitmap
    pub fn to_roaring(&self) -> RoaringBitmap {
        self.iter().collect()
    }
}

impl From<&RoaringBitmap> for ConcurrentBitSet {
    fn from(bitmap: &RoaringBitmap) -> Self {
        let set = match bitmap.max() {
            Some(max) => Self::with_capacity(max.saturating_add(1)),
            None => Self::new(),
        };
        for bit in bitmap {
            set.set(bit);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_new_is_empty() {
        let set = ConcurrentBitSet::new();
        assert!(set.is_empty());
        assert_eq!(set.cardinality(), 0);
        assert!(!set.get(0));
        assert!(!set.get(1_000_000));
    }

    #[test]
    fn test_set_get_clear() {
        let set = ConcurrentBitSet::new();

        assert!(!set.set(3));
        assert!(set.set(3));
        assert!(set.get(3));
        assert!(!set.get(2));

        assert!(set.clear(3));
        assert!(!set.get(3));
        assert!(!set.clear(3));
    }

    #[test]
    fn test_clear_beyond_capacity_is_noop() {
        let set = ConcurrentBitSet::with_capacity(64);
        assert!(!set.clear(10_000));
        assert!(set.is_empty());
    }

    #[test]
    fn test_grows_on_demand() {
        let set = ConcurrentBitSet::new();
        set.set(1);
        set.set(64);
        set.set(100_000);

        assert!(set.get(1));
        assert!(set.get(64));
        assert!(set.get(100_000));
        assert!(!set.get(99_999));
        assert_eq!(set.cardinality(), 3);
    }

    #[test]
    fn test_iter_in_order() {
        let set = ConcurrentBitSet::new();
        for bit in [130, 5, 64, 63, 0] {
            set.set(bit);
        }
        let bits: Vec<u32> = set.iter().collect();
        assert_eq!(bits, vec![0, 5, 63, 64, 130]);
    }

    #[test]
    fn test_roaring_conversion() {
        let mut bitmap = RoaringBitmap::new();
        bitmap.insert(7);
        bitmap.insert(4096);
        bitmap.insert(70_000);

        let set = ConcurrentBitSet::from(&bitmap);
        assert!(set.get(7));
        assert!(set.get(4096));
        assert!(set.get(70_000));
        assert_eq!(set.cardinality(), 3);
        assert_eq!(set.to_roaring(), bitmap);
    }

    #[test]
    fn test_concurrent_duplicate_sets() {
        let set = ConcurrentBitSet::new();
        let first_setters = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for bit in 1..2000 {
                        if !set.set(bit) {
                            first_setters.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(set.cardinality(), 1999);
        assert_eq!(first_setters.load(Ordering::Relaxed), 1999);
    }
}
