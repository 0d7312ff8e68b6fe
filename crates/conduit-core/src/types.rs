//! # CONDUIT Core Types
//!
//! Strongly typed addresses, sizes and identifiers shared across the stack.

use core::fmt;
use core::ops::{Add, Sub};

use crate::error::{Error, Result};

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space. Never a CPU pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low 32 bits, as written by two-word address methods
    #[inline]
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// High 32 bits
    #[inline]
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Rebuild from a `(lo, hi)` method pair
    #[inline]
    pub const fn from_parts(lo: u32, hi: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// BYTE SIZE
// =============================================================================

/// Byte size with unit helpers
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from GiB
    #[inline]
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Number of 32-bit words, rounded up
    #[inline]
    pub const fn as_words(self) -> usize {
        self.0.div_ceil(4) as usize
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 && self.0 % (1024 * 1024 * 1024) == 0 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// GPU IDENTIFIER
// =============================================================================

/// Identifier of one attached GPU, used to key peer tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GpuId(pub u32);

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.0)
    }
}

// =============================================================================
// BUFFER LOCATION
// =============================================================================

/// Where a channel buffer (GPFIFO, GPPUT, pushbuffer) is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferLocation {
    /// Let the device layer choose
    #[default]
    Auto,
    /// System memory
    Sys,
    /// Video memory
    Vid,
}

impl BufferLocation {
    /// Parse the textual form used by tunables (`"sys"`, `"vid"`, `"auto"`)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            s if s.eq_ignore_ascii_case("sys") => Ok(Self::Sys),
            s if s.eq_ignore_ascii_case("vid") => Ok(Self::Vid),
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Textual form
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Sys => "sys",
            Self::Vid => "vid",
        }
    }
}

impl fmt::Display for BufferLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::format;

    #[test]
    fn test_addr_parts() {
        let addr = GpuAddr::new(0x1234_5678_9abc_def0);
        assert_eq!(addr.lo(), 0x9abc_def0);
        assert_eq!(addr.hi(), 0x1234_5678);
        assert_eq!(GpuAddr::from_parts(addr.lo(), addr.hi()), addr);
        assert_eq!(addr.offset(0x10) - addr, 0x10);
    }

    #[test]
    fn test_byte_size_format() {
        assert_eq!(format!("{}", ByteSize::from_kib(128)), "128 KiB");
        assert_eq!(format!("{}", ByteSize::from_bytes(1500)), "1500 B");
        assert_eq!(ByteSize::from_bytes(9).as_words(), 3);
    }

    #[test]
    fn test_location_parse() {
        assert_eq!(BufferLocation::parse("sys").unwrap(), BufferLocation::Sys);
        assert_eq!(BufferLocation::parse(" VID ").unwrap(), BufferLocation::Vid);
        assert_eq!(BufferLocation::parse("auto").unwrap(), BufferLocation::Auto);
        assert_eq!(BufferLocation::parse("host"), Err(Error::InvalidParameter));
    }
}
