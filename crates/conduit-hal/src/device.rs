//! # Device Collaborators
//!
//! What the submission core needs from the privileged device layer:
//! memory, hardware queues and queue groups, copy engine capabilities and
//! error state.

use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use bitflags::bitflags;

use conduit_core::{BufferLocation, ByteSize, Error, GpuAddr, GpuId, Result};

use crate::crypto::CslContext;
use crate::methods::{CeHal, HostHal, Sec2Hal};

/// Maximum number of logical copy engines on a device
pub const MAX_COPY_ENGINES: usize = 32;

// =============================================================================
// MEMORY
// =============================================================================

bitflags! {
    /// Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Only reachable by the GPU inside the trusted boundary
        const PROTECTED = 1 << 0;
        /// Zero on allocation
        const ZEROED = 1 << 1;
    }
}

/// Memory allocation request
#[derive(Debug, Clone, Copy)]
pub struct AllocDesc {
    /// Size in bytes
    pub size: ByteSize,
    /// Requested aperture
    pub location: BufferLocation,
    /// Flags
    pub flags: AllocFlags,
    /// Debug name
    pub name: &'static str,
}

impl AllocDesc {
    /// Zeroed allocation in the given location
    pub const fn new(name: &'static str, size: ByteSize, location: BufferLocation) -> Self {
        Self {
            size,
            location,
            flags: AllocFlags::ZEROED,
            name,
        }
    }

    /// Mark the allocation protected
    pub const fn protected(mut self) -> Self {
        self.flags = self.flags.union(AllocFlags::PROTECTED);
        self
    }
}

/// A device memory allocation
pub trait DeviceMemory: Send + Sync {
    /// GPU virtual address of the first byte
    fn gpu_va(&self) -> GpuAddr;

    /// Allocation size
    fn size(&self) -> ByteSize;

    /// Whether the CPU is locked out
    fn is_protected(&self) -> bool;

    /// CPU mapping as 32-bit words, `None` for protected memory
    fn cpu_words(&self) -> Option<&[AtomicU32]>;

    /// Read one word through the CPU mapping
    fn read_u32(&self, offset: usize) -> Result<u32> {
        let words = self.cpu_words().ok_or(Error::AccessDenied)?;
        let word = words.get(offset / 4).ok_or(Error::InvalidParameter)?;
        Ok(word.load(Ordering::Acquire))
    }

    /// Write one word through the CPU mapping
    fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let words = self.cpu_words().ok_or(Error::AccessDenied)?;
        let word = words.get(offset / 4).ok_or(Error::InvalidParameter)?;
        word.store(value, Ordering::Release);
        Ok(())
    }
}

// =============================================================================
// ENGINES
// =============================================================================

/// Engine class a queue runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineType {
    /// Copy engine
    Ce,
    /// Security co-processor
    Sec2,
}

bitflags! {
    /// Copy engine capability bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CeCapsFlags: u32 {
        /// Engine exists and can be used
        const SUPPORTED = 1 << 0;
        /// Graphics-paired CE
        const GRCE = 1 << 1;
        /// Shares physical engines with another logical CE
        const SHARED = 1 << 2;
        /// Can access system memory
        const SYSMEM = 1 << 3;
        /// Fast system memory reads
        const SYSMEM_READ = 1 << 4;
        /// Fast system memory writes
        const SYSMEM_WRITE = 1 << 5;
        /// Connected to NVLINK peers
        const NVLINK_P2P = 1 << 6;
        /// Can access peer memory
        const P2P = 1 << 7;
        /// Supports encrypt/decrypt
        const SECURE = 1 << 8;
    }
}

/// Capabilities of one logical copy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyEngineCaps {
    /// Capability bits
    pub flags: CeCapsFlags,
    /// Physical copy engines backing this logical engine
    pub pce_mask: u32,
}

impl CopyEngineCaps {
    /// Caps with the given flags and PCE mask
    pub const fn new(flags: CeCapsFlags, pce_mask: u32) -> Self {
        Self { flags, pce_mask }
    }

    /// Check a capability
    pub const fn has(&self, flag: CeCapsFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Number of physical engines
    pub const fn pce_count(&self) -> u32 {
        self.pce_mask.count_ones()
    }
}

/// Capability table indexed by logical CE
pub type CopyEngineTable = ArrayVec<CopyEngineCaps, MAX_COPY_ENGINES>;

// =============================================================================
// QUEUES
// =============================================================================

/// Parameters for a hardware queue allocation
#[derive(Debug, Clone, Copy)]
pub struct QueueAllocParams {
    /// GPFIFO entries (power of two)
    pub num_gpfifo_entries: u32,
    /// GPFIFO aperture
    pub gpfifo_location: BufferLocation,
    /// GPPUT aperture
    pub gpput_location: BufferLocation,
    /// GPFIFO and GPPUT are protected; CPU writes are refused
    pub secure: bool,
    /// Submissions go through [`HwQueue::push_stream`]
    pub proxy: bool,
}

/// Static description of an allocated queue
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    /// Runlist the queue is scheduled on
    pub hw_runlist_id: u32,
    /// Hardware channel id
    pub hw_channel_id: u32,
    /// Value written to the doorbell to schedule this queue
    pub work_submission_token: u32,
    /// GPU address of the GPFIFO ring
    pub gpfifo_gpu_va: GpuAddr,
    /// GPU address of the GPPUT word
    pub gpput_gpu_va: GpuAddr,
    /// GPFIFO entries
    pub num_gpfifo_entries: u32,
}

impl QueueInfo {
    /// GPU address of one GPFIFO slot
    pub const fn gpfifo_entry_va(&self, index: u32) -> GpuAddr {
        self.gpfifo_gpu_va.offset(index as u64 * 8)
    }
}

/// A group of queues sharing an engine instance
pub trait QueueGroup: Send + Sync {
    /// Engine class
    fn engine(&self) -> EngineType;

    /// Engine instance
    fn engine_index(&self) -> u32;
}

/// One hardware command queue
pub trait HwQueue: Send + Sync {
    /// Static queue description
    fn info(&self) -> &QueueInfo;

    /// Write a GPFIFO slot; refused for secure queues
    fn write_gpfifo_entry(&self, index: u32, entry: u64) -> Result<()>;

    /// Publish a new GPPUT; refused for secure queues
    fn write_gpu_put(&self, put: u32) -> Result<()>;

    /// Tell the host to re-read GPPUT
    fn ring_doorbell(&self);

    /// Error notifier; zero while the queue is healthy
    fn error_notifier(&self) -> u32;

    /// Hand a method stream to the device layer to submit on our behalf
    fn push_stream(&self, words: &[u32]) -> Result<()> {
        let _ = words;
        Err(Error::NotSupported)
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// The device layer
pub trait Device: Send + Sync {
    /// Memory allocation type
    type Memory: DeviceMemory + 'static;
    /// Queue group type
    type QueueGroup: QueueGroup + 'static;
    /// Queue type
    type Queue: HwQueue + 'static;
    /// Encryption session type
    type Csl: CslContext + 'static;

    /// GPU identifier
    fn id(&self) -> GpuId;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Whether the GPU has local video memory
    fn has_vidmem(&self) -> bool;

    /// Whether work must go through device-owned proxy channels
    fn uses_proxy_channels(&self) -> bool;

    /// Whether confidential computing is on
    fn conf_computing_enabled(&self) -> bool;

    /// Whether ECC reporting is on
    fn ecc_enabled(&self) -> bool;

    /// Whether an uncorrectable ECC error is pending
    fn ecc_error_pending(&self) -> bool;

    /// Copy engine capability table
    fn copy_engine_caps(&self) -> Result<CopyEngineTable>;

    /// Number of security co-processor engines
    fn sec2_engine_count(&self) -> u32 {
        if self.conf_computing_enabled() { 1 } else { 0 }
    }

    /// Allocate device memory
    fn alloc_memory(&self, desc: &AllocDesc) -> Result<Self::Memory>;

    /// Allocate a queue group on an engine instance
    fn alloc_queue_group(&self, engine: EngineType, index: u32) -> Result<Self::QueueGroup>;

    /// Allocate a queue inside a group
    fn alloc_queue(&self, group: &Self::QueueGroup, params: &QueueAllocParams)
    -> Result<Self::Queue>;

    /// Open the CPU side of a secure queue's encryption session
    fn open_csl(&self, queue: &Self::Queue) -> Result<Self::Csl>;

    /// Host method emitter
    fn host_hal(&self) -> &dyn HostHal;

    /// Copy engine method emitter
    fn ce_hal(&self) -> &dyn CeHal;

    /// Security co-processor method emitter
    fn sec2_hal(&self) -> &dyn Sec2Hal;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps() {
        let caps = CopyEngineCaps::new(CeCapsFlags::SUPPORTED | CeCapsFlags::P2P, 0b1011);
        assert!(caps.has(CeCapsFlags::P2P));
        assert!(!caps.has(CeCapsFlags::GRCE));
        assert_eq!(caps.pce_count(), 3);
    }

    #[test]
    fn test_alloc_desc() {
        let desc = AllocDesc::new("gpfifo", ByteSize::from_kib(8), BufferLocation::Vid).protected();
        assert!(desc.flags.contains(AllocFlags::PROTECTED | AllocFlags::ZEROED));
    }

    #[test]
    fn test_gpfifo_entry_va() {
        let info = QueueInfo {
            hw_runlist_id: 0,
            hw_channel_id: 3,
            work_submission_token: 3,
            gpfifo_gpu_va: GpuAddr::new(0x1000),
            gpput_gpu_va: GpuAddr::new(0x2000),
            num_gpfifo_entries: 32,
        };
        assert_eq!(info.gpfifo_entry_va(3), GpuAddr::new(0x1018));
    }
}
