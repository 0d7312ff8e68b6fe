//! Simulated GPU address space.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use conduit_core::{ByteSize, Error, GpuAddr, Result};

use crate::device::DeviceMemory;

const VA_BASE: u64 = 0x10_0000_0000;
const VA_ALIGN: u64 = 4096;

struct Region {
    words: Arc<[AtomicU32]>,
    protected: bool,
}

/// Flat GPU virtual address space backed by host words
pub(crate) struct AddressSpace {
    regions: RwLock<BTreeMap<u64, Region>>,
    next_va: AtomicU64,
}

impl AddressSpace {
    pub(crate) fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            next_va: AtomicU64::new(VA_BASE),
        }
    }

    pub(crate) fn alloc(self: &Arc<Self>, size: ByteSize, protected: bool) -> Result<SimMemory> {
        if size.as_bytes() == 0 {
            return Err(Error::InvalidParameter);
        }
        let words: Vec<AtomicU32> = (0..size.as_words()).map(|_| AtomicU32::new(0)).collect();
        let words: Arc<[AtomicU32]> = words.into();

        // Leave an unmapped page between allocations
        let span = size.align_up(VA_ALIGN).as_bytes() + VA_ALIGN;
        let base = self.next_va.fetch_add(span, Ordering::Relaxed);

        self.regions
            .write()
            .map_err(|_| Error::InvalidState)?
            .insert(
                base,
                Region {
                    words: words.clone(),
                    protected,
                },
            );

        Ok(SimMemory {
            base: GpuAddr::new(base),
            size,
            words,
            protected,
            space: self.clone(),
        })
    }

    fn free(&self, base: GpuAddr) {
        if let Ok(mut regions) = self.regions.write() {
            regions.remove(&base.raw());
        }
    }

    /// Resolve `words` words at `va` to a backing slice and word offset
    pub(crate) fn resolve(&self, va: GpuAddr, words: usize) -> Result<(Arc<[AtomicU32]>, usize)> {
        if !va.is_aligned(4) {
            return Err(Error::InvalidParameter);
        }
        let regions = self.regions.read().map_err(|_| Error::InvalidState)?;
        let (base, region) = regions
            .range(..=va.raw())
            .next_back()
            .ok_or(Error::NotFound)?;
        let offset = ((va.raw() - base) / 4) as usize;
        if offset + words > region.words.len() {
            return Err(Error::NotFound);
        }
        Ok((region.words.clone(), offset))
    }

    pub(crate) fn is_protected(&self, va: GpuAddr) -> Result<bool> {
        let regions = self.regions.read().map_err(|_| Error::InvalidState)?;
        let (_, region) = regions
            .range(..=va.raw())
            .next_back()
            .ok_or(Error::NotFound)?;
        Ok(region.protected)
    }

    pub(crate) fn read(&self, va: GpuAddr) -> Result<u32> {
        let (words, offset) = self.resolve(va, 1)?;
        Ok(words[offset].load(Ordering::Acquire))
    }

    pub(crate) fn write(&self, va: GpuAddr, value: u32) -> Result<()> {
        let (words, offset) = self.resolve(va, 1)?;
        words[offset].store(value, Ordering::Release);
        Ok(())
    }

    pub(crate) fn read_block(&self, va: GpuAddr, count: usize) -> Result<Vec<u32>> {
        let (words, offset) = self.resolve(va, count)?;
        Ok(words[offset..offset + count]
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect())
    }

    pub(crate) fn write_block(&self, va: GpuAddr, data: &[u32]) -> Result<()> {
        let (words, offset) = self.resolve(va, data.len())?;
        for (slot, value) in words[offset..offset + data.len()].iter().zip(data) {
            slot.store(*value, Ordering::Release);
        }
        Ok(())
    }
}

/// A simulated allocation
pub struct SimMemory {
    base: GpuAddr,
    size: ByteSize,
    words: Arc<[AtomicU32]>,
    protected: bool,
    space: Arc<AddressSpace>,
}

impl SimMemory {
    /// Backing words, ignoring protection
    pub(crate) fn raw_words(&self) -> &[AtomicU32] {
        &self.words
    }
}

impl core::fmt::Debug for SimMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimMemory")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("protected", &self.protected)
            .finish()
    }
}

impl DeviceMemory for SimMemory {
    fn gpu_va(&self) -> GpuAddr {
        self.base
    }

    fn size(&self) -> ByteSize {
        self.size
    }

    fn is_protected(&self) -> bool {
        self.protected
    }

    fn cpu_words(&self) -> Option<&[AtomicU32]> {
        if self.protected {
            None
        } else {
            Some(&self.words)
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        self.space.free(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_resolve() {
        let space = Arc::new(AddressSpace::new());
        let a = space.alloc(ByteSize::from_bytes(64), false).unwrap();
        let b = space.alloc(ByteSize::from_bytes(64), true).unwrap();
        assert!(b.gpu_va() > a.gpu_va() + 64);

        space.write(a.gpu_va() + 8, 42).unwrap();
        assert_eq!(a.read_u32(8).unwrap(), 42);
        assert!(b.cpu_words().is_none());
        assert_eq!(b.read_u32(0), Err(Error::AccessDenied));
        assert!(space.is_protected(b.gpu_va()).unwrap());

        // Past the end of an allocation is unmapped
        assert_eq!(space.read(a.gpu_va() + 64), Err(Error::NotFound));
    }

    #[test]
    fn test_free_on_drop() {
        let space = Arc::new(AddressSpace::new());
        let mem = space.alloc(ByteSize::from_bytes(16), false).unwrap();
        let va = mem.gpu_va();
        drop(mem);
        assert_eq!(space.read(va), Err(Error::NotFound));
    }
}
