//! Provides `LevelBitmap`, a small bit array supporting constant-time
//! highest-set-bit scan operations, used to track priority levels with
//! deferred work pending.
use core::fmt;

use super::Init;

/// The number of bits a [`LevelBitmap`] can store.
pub(crate) const LEVEL_BITMAP_LEN: usize = 32;

/// A bit array indexed by priority level.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LevelBitmap {
    bits: u32,
}

impl Init for LevelBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for LevelBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEVEL_BITMAP_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl LevelBitmap {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < LEVEL_BITMAP_LEN);
        (self.bits >> i) & 1 != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < LEVEL_BITMAP_LEN);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    pub fn clear(&mut self, i: usize) {
        assert!(i < LEVEL_BITMAP_LEN);
        self.bits &= !(1 << i);
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Get the position of the highest set bit.
    pub fn find_highest_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(31 - self.bits.leading_zeros() as usize)
        }
    }

    /// Get the position of the highest set bit at or below `max`.
    pub fn find_highest_set_at_most(&self, max: usize) -> Option<usize> {
        assert!(max < LEVEL_BITMAP_LEN);
        let mask = if max == 31 { u32::MAX } else { (1 << (max + 1)) - 1 };
        let truncated = Self {
            bits: self.bits & mask,
        };
        truncated.find_highest_set()
    }
}
