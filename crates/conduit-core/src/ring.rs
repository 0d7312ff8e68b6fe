//! # Ring Indices
//!
//! Bounded index arithmetic for power-of-two hardware rings.
//!
//! A ring of `size` slots always keeps [`SENTINEL_SLOTS`] unused so that
//! `put == get` unambiguously means empty. All index math goes through
//! [`Ring`], which masks instead of relying on unsigned wraparound.

use static_assertions::const_assert;

use crate::error::{Error, Result};

/// Slots a ring keeps permanently free to tell full from empty
pub const SENTINEL_SLOTS: u32 = 1;

/// Smallest ring the driver accepts
pub const MIN_RING_SIZE: u32 = 2;

const_assert!(MIN_RING_SIZE > SENTINEL_SLOTS);

// =============================================================================
// RING INDEX
// =============================================================================

/// Position inside a ring, always `< size`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct RingIndex(u32);

impl RingIndex {
    /// First slot
    pub const ZERO: Self = Self(0);

    /// Raw slot number
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot number usable as a slice index
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// RING GEOMETRY
// =============================================================================

/// Geometry of a power-of-two ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    size: u32,
    mask: u32,
}

impl Ring {
    /// Create a ring geometry; `size` must be a power of two `>= 2`
    pub const fn new(size: u32) -> Result<Self> {
        if size < MIN_RING_SIZE || !size.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            size,
            mask: size - 1,
        })
    }

    /// Total number of slots
    #[inline]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Slots that may be occupied at once
    #[inline]
    pub const fn capacity(&self) -> u32 {
        self.size - SENTINEL_SLOTS
    }

    /// Wrap a raw value into the ring
    #[inline]
    pub const fn index(&self, raw: u64) -> RingIndex {
        RingIndex((raw & self.mask as u64) as u32)
    }

    /// Slot after `idx`
    #[inline]
    pub const fn next(&self, idx: RingIndex) -> RingIndex {
        RingIndex((idx.0 + 1) & self.mask)
    }

    /// Slot before `idx`
    #[inline]
    pub const fn prev(&self, idx: RingIndex) -> RingIndex {
        RingIndex(idx.0.wrapping_sub(1) & self.mask)
    }

    /// Slot `n` after `idx`
    #[inline]
    pub const fn advance(&self, idx: RingIndex, n: u32) -> RingIndex {
        RingIndex(idx.0.wrapping_add(n) & self.mask)
    }

    /// Number of steps from `from` to `to`
    #[inline]
    pub const fn distance(&self, from: RingIndex, to: RingIndex) -> u32 {
        to.0.wrapping_sub(from.0) & self.mask
    }

    /// Slots still claimable given the hardware `get`, the CPU `put` and
    /// reservations not yet turned into entries
    pub fn available(&self, get: RingIndex, put: RingIndex, in_flight: u32) -> u32 {
        self.capacity()
            .saturating_sub(self.distance(get, put))
            .saturating_sub(in_flight)
    }

    /// Check the occupancy invariant
    pub fn check(&self, get: RingIndex, put: RingIndex, in_flight: u32) -> Result<()> {
        let used = self.distance(get, put) as u64 + in_flight as u64;
        if used > self.capacity() as u64 {
            return Err(Error::RingOverflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert!(Ring::new(0).is_err());
        assert!(Ring::new(1).is_err());
        assert!(Ring::new(48).is_err());
        let ring = Ring::new(32).unwrap();
        assert_eq!(ring.capacity(), 31);
        assert_eq!(ring.index(33).raw(), 1);
    }

    #[test]
    fn test_wrapping() {
        let ring = Ring::new(8).unwrap();
        let last = ring.index(7);
        assert_eq!(ring.next(last), RingIndex::ZERO);
        assert_eq!(ring.prev(RingIndex::ZERO), last);
        assert_eq!(ring.advance(last, 3).raw(), 2);
        assert_eq!(ring.distance(last, ring.index(2)), 3);
        assert_eq!(ring.distance(ring.index(2), last), 5);
    }

    #[test]
    fn test_available_respects_sentinel() {
        let ring = Ring::new(8).unwrap();
        let get = ring.index(6);
        assert_eq!(ring.available(get, get, 0), 7);
        assert_eq!(ring.available(get, ring.index(1), 0), 4);
        assert_eq!(ring.available(get, ring.index(1), 4), 0);
        assert_eq!(ring.available(get, ring.index(5), 0), 0);
        assert!(ring.check(get, ring.index(5), 0).is_ok());
        assert_eq!(ring.check(get, ring.index(5), 1), Err(Error::RingOverflow));
    }
}
