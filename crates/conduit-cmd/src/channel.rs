//! # Channels
//!
//! A channel is one hardware queue plus the tracking semaphore that
//! reports how far the GPU has got through it.

use alloc::sync::Arc;
use core::fmt;
use core::fmt::Write;

use arrayvec::ArrayString;

use conduit_core::{Error, GpuAddr, Result};
use conduit_hal::{Device, HwQueue, QueueInfo};

use crate::pool::PoolType;
use crate::secure::{CryptoStats, LaunchSlots};
use crate::semaphore::{SecureRead, TrackingSemaphore};

// =============================================================================
// CHANNEL TYPE
// =============================================================================

/// What work a channel is reserved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    /// Copies from system memory into the GPU
    CpuToGpu,
    /// Copies from the GPU into system memory
    GpuToCpu,
    /// Copies within the GPU
    GpuInternal,
    /// Memsets and semaphore work
    Memops,
    /// Copies to a peer GPU
    GpuToGpu,
    /// Security co-processor work
    Sec2,
    /// Secure launch: decrypt-and-execute schedule
    Wlc,
    /// Secure launch: keeps the schedule primed
    Lcic,
}

impl ChannelType {
    /// Copy engine types, in the order engines are picked for them
    pub const CE_TYPES: [ChannelType; 5] = [
        ChannelType::CpuToGpu,
        ChannelType::GpuToCpu,
        ChannelType::GpuInternal,
        ChannelType::GpuToGpu,
        ChannelType::Memops,
    ];

    /// Position in [`ChannelType::CE_TYPES`]
    pub const fn ce_slot(self) -> Option<usize> {
        match self {
            ChannelType::CpuToGpu => Some(0),
            ChannelType::GpuToCpu => Some(1),
            ChannelType::GpuInternal => Some(2),
            ChannelType::GpuToGpu => Some(3),
            ChannelType::Memops => Some(4),
            _ => None,
        }
    }

    /// Whether the type is served by a copy engine pool
    pub const fn is_ce(self) -> bool {
        self.ce_slot().is_some()
    }

    /// Short name
    pub const fn name(self) -> &'static str {
        match self {
            ChannelType::CpuToGpu => "CPU_TO_GPU",
            ChannelType::GpuToCpu => "GPU_TO_CPU",
            ChannelType::GpuInternal => "GPU_INTERNAL",
            ChannelType::Memops => "MEMOPS",
            ChannelType::GpuToGpu => "GPU_TO_GPU",
            ChannelType::Sec2 => "SEC2",
            ChannelType::Wlc => "WLC",
            ChannelType::Lcic => "LCIC",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Channel name as shown in logs
pub type ChannelName = ArrayString<32>;

/// One hardware queue and its completion tracking
pub struct Channel<D: Device> {
    pub(crate) name: ChannelName,
    pub(crate) queue: D::Queue,
    /// Session opened on this queue
    pub(crate) csl: Option<Arc<D::Csl>>,
    pub(crate) tracking: TrackingSemaphore<D::Memory>,
    /// Session whose device half encrypts the tracking semaphore
    pub(crate) tracking_csl: Option<Arc<D::Csl>>,
    /// Fixed launch schedule (WLC only)
    pub(crate) launch: Option<LaunchSlots<D::Memory>>,
}

impl<D: Device> Channel<D> {
    pub(crate) fn new(
        pool_type: PoolType,
        engine_index: u32,
        index: usize,
        queue: D::Queue,
        tracking: TrackingSemaphore<D::Memory>,
    ) -> Self {
        let mut name = ChannelName::new();
        let _ = write!(name, "{}{} #{}", pool_type.name(), engine_index, index);
        Self {
            name,
            queue,
            csl: None,
            tracking,
            tracking_csl: None,
            launch: None,
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hardware queue description
    pub fn queue_info(&self) -> &QueueInfo {
        self.queue.info()
    }

    /// Tracking semaphore
    pub fn tracking(&self) -> &TrackingSemaphore<D::Memory> {
        &self.tracking
    }

    /// GPU address of the tracking semaphore payload
    pub fn tracking_gpu_va(&self) -> GpuAddr {
        self.tracking.gpu_va()
    }

    /// Session the tracking semaphore is read with
    pub(crate) fn secure_read<'a>(&'a self, stats: &'a CryptoStats) -> Option<SecureRead<'a>> {
        self.tracking_csl.as_deref().map(|csl| SecureRead { csl, stats })
    }

    /// Health of the channel
    ///
    /// A raised error notifier is a robust-channel error unless an
    /// uncorrectable ECC error is pending.
    pub fn get_status(&self, device: &D) -> Result<()> {
        if self.queue.error_notifier() != 0 {
            if device.ecc_enabled() && device.ecc_error_pending() {
                return Err(Error::EccError);
            }
            return Err(Error::ChannelError);
        }
        if device.ecc_enabled() && device.ecc_error_pending() {
            return Err(Error::EccError);
        }
        Ok(())
    }

    /// Whether every queued value has completed, from the cached counter
    pub fn is_idle(&self) -> bool {
        self.tracking.completed() >= self.tracking.queued()
    }
}

impl<D: Device> fmt::Debug for Channel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name.as_str())
            .field("queue", self.queue.info())
            .field("queued", &self.tracking.queued())
            .field("completed", &self.tracking.completed())
            .field("secure", &self.tracking.is_secure())
            .finish()
    }
}
