//! Block bitmap of a repair request

use std::fmt;

/// Number of blocks one repair request can address
pub const REPAIR_BITMAP_BITS: usize = 192;

const WORDS: usize = REPAIR_BITMAP_BITS / 64;

/// Set bit `i` means block `first_block + i` is carried by the request
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairBitmap([u64; WORDS]);

impl RepairBitmap {
    #[must_use]
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    #[must_use]
    pub const fn from_words(words: [u64; WORDS]) -> Self {
        Self(words)
    }

    #[must_use]
    pub const fn words(&self) -> [u64; WORDS] {
        self.0
    }

    /// Bitmap with the given positions set; positions past the end are ignored
    pub fn from_positions(positions: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmap = Self::new();
        for pos in positions {
            bitmap.set(pos);
        }
        bitmap
    }

    pub fn set(&mut self, pos: usize) {
        if pos < REPAIR_BITMAP_BITS {
            self.0[pos / 64] |= 1 << (pos % 64);
        }
    }

    #[must_use]
    pub fn test(&self, pos: usize) -> bool {
        pos < REPAIR_BITMAP_BITS && self.0[pos / 64] & (1 << (pos % 64)) != 0
    }

    #[must_use]
    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Highest set position
    #[must_use]
    pub fn last_set(&self) -> Option<usize> {
        (0..REPAIR_BITMAP_BITS).rev().find(|&pos| self.test(pos))
    }

    /// Set positions in increasing order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..REPAIR_BITMAP_BITS).filter(|&pos| self.test(pos))
    }

    /// Split at `at`: positions below stay in the first half, the others
    /// are shifted down by `at` into the second
    #[must_use]
    pub fn split_at(&self, at: usize) -> (Self, Self) {
        let mut low = Self::new();
        let mut high = Self::new();
        for pos in self.iter_ones() {
            if pos < at {
                low.set(pos);
            } else {
                high.set(pos - at);
            }
        }
        (low, high)
    }

    /// Runs of consecutive set positions as `(start, len)`
    #[must_use]
    pub fn runs(&self) -> Vec<(usize, usize)> {
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for pos in self.iter_ones() {
            match runs.last_mut() {
                Some((start, len)) if *start + *len == pos => *len += 1,
                _ => runs.push((pos, 1)),
            }
        }
        runs
    }
}

impl fmt::Debug for RepairBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RepairBitmap({:016x}:{:016x}:{:016x})",
            self.0[2], self.0[1], self.0[0]
        )
    }
}
