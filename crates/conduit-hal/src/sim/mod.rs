//! # Simulated GPU
//!
//! An in-process device model for tests. Queues execute on whichever
//! thread rings their doorbell, so submission is synchronous unless the
//! device is paused. Memory is a flat address space of host words with a
//! protected flag per allocation.

mod crypto;
mod memory;
mod methods;
mod queue;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use arrayvec::ArrayVec;

use conduit_core::{BufferLocation, Error, GpuAddr, GpuId, Result};

use crate::device::{
    AllocDesc, AllocFlags, CeCapsFlags, CopyEngineCaps, CopyEngineTable, Device, EngineType,
    QueueAllocParams, QueueInfo,
};
use crate::methods::{CeHal, HostHal, Sec2Hal};

pub use crypto::SimCsl;
pub use memory::SimMemory;
pub use methods::{SimCe, SimHost, SimSec2};
pub use queue::{NOTIFIER_INTEGRITY_FAULT, NOTIFIER_METHOD_FAULT, SimQueue, SimQueueGroup};

use crypto::KeyCtx;
use memory::AddressSpace;
use queue::QueueState;

/// Simulated device configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// GPU id
    pub id: GpuId,
    /// Device name
    pub name: String,
    /// Local video memory present
    pub has_vidmem: bool,
    /// Confidential computing on
    pub conf_computing: bool,
    /// Work must go through proxy channels
    pub proxy_channels: bool,
    /// ECC reporting on
    pub ecc_enabled: bool,
    /// Copy engine table
    pub copy_engines: CopyEngineTable,
}

impl SimConfig {
    /// Four logical CEs with a GRCE, mixed sysmem and NVLINK capabilities
    pub fn default_copy_engines() -> CopyEngineTable {
        let secure = CeCapsFlags::SUPPORTED | CeCapsFlags::SECURE;
        let sysmem = CeCapsFlags::SYSMEM;
        let mut table = ArrayVec::new();
        table.push(CopyEngineCaps::new(
            secure | CeCapsFlags::GRCE | sysmem | CeCapsFlags::SYSMEM_READ | CeCapsFlags::SYSMEM_WRITE,
            0b0001,
        ));
        table.push(CopyEngineCaps::new(
            secure | sysmem | CeCapsFlags::SYSMEM_READ | CeCapsFlags::SYSMEM_WRITE | CeCapsFlags::P2P,
            0b0110,
        ));
        table.push(CopyEngineCaps::new(
            secure | sysmem | CeCapsFlags::SYSMEM_WRITE | CeCapsFlags::P2P | CeCapsFlags::NVLINK_P2P,
            0b1000,
        ));
        table.push(CopyEngineCaps::new(
            secure | CeCapsFlags::P2P | CeCapsFlags::NVLINK_P2P | CeCapsFlags::SHARED,
            0b11_0000,
        ));
        table
    }

    /// Plain device
    pub fn new(id: u32) -> Self {
        Self {
            id: GpuId(id),
            name: alloc::format!("sim{}", id),
            has_vidmem: true,
            conf_computing: false,
            proxy_channels: false,
            ecc_enabled: true,
            copy_engines: Self::default_copy_engines(),
        }
    }

    /// Confidential computing device
    pub fn confidential(id: u32) -> Self {
        Self {
            conf_computing: true,
            ..Self::new(id)
        }
    }

    /// Virtualized device that needs proxy channels
    pub fn virtualized(id: u32) -> Self {
        Self {
            proxy_channels: true,
            ..Self::new(id)
        }
    }
}

pub(crate) struct SimGpu {
    pub(crate) space: Arc<AddressSpace>,
    queues: RwLock<Vec<Weak<QueueState>>>,
    paused: AtomicBool,
    ecc_pending: AtomicBool,
    next_channel: AtomicU32,
}

impl SimGpu {
    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn live_queues(&self) -> Vec<Arc<QueueState>> {
        match self.queues.read() {
            Ok(queues) => queues.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn find(&self, token: u32) -> Option<Arc<QueueState>> {
        self.live_queues()
            .into_iter()
            .find(|q| q.info.work_submission_token == token)
    }

    pub(crate) fn ring_doorbell(&self, token: u32) {
        if let Some(queue) = self.find(token) {
            queue.kick();
        }
    }

    pub(crate) fn kick_stalled(&self, except: u32) {
        for queue in self.live_queues() {
            if queue.info.hw_channel_id != except && queue.stalled.load(Ordering::Acquire) {
                queue.kick();
            }
        }
    }
}

/// Handle to a simulated GPU
///
/// Cloning yields another handle to the same device, so tests keep one
/// for fault injection while the channel manager owns the other.
#[derive(Clone)]
pub struct SimDevice {
    gpu: Arc<SimGpu>,
    config: Arc<SimConfig>,
}

impl core::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimDevice").field("config", &self.config).finish()
    }
}

impl SimDevice {
    /// Create a device
    pub fn new(config: SimConfig) -> Self {
        Self {
            gpu: Arc::new(SimGpu {
                space: Arc::new(AddressSpace::new()),
                queues: RwLock::new(Vec::new()),
                paused: AtomicBool::new(false),
                ecc_pending: AtomicBool::new(false),
                next_channel: AtomicU32::new(1),
            }),
            config: Arc::new(config),
        }
    }

    /// Stop executing work; doorbells are remembered
    pub fn pause(&self) {
        self.gpu.paused.store(true, Ordering::SeqCst);
    }

    /// Resume and run everything that was rung while paused
    pub fn resume(&self) {
        self.gpu.paused.store(false, Ordering::SeqCst);
        for queue in self.gpu.live_queues() {
            if queue.has_pending_kick() || queue.stalled.load(Ordering::Acquire) {
                queue.kick();
            }
        }
    }

    /// Put a channel into the error state
    pub fn inject_channel_error(&self, hw_channel_id: u32, code: u32) -> Result<()> {
        let queue = self
            .gpu
            .live_queues()
            .into_iter()
            .find(|q| q.info.hw_channel_id == hw_channel_id)
            .ok_or(Error::NotFound)?;
        queue.set_error(code);
        Ok(())
    }

    /// Make CPU writes of a channel's GPFIFO and GPPUT fail
    pub fn set_queue_write_fault(&self, hw_channel_id: u32, fault: bool) -> Result<()> {
        let queue = self
            .gpu
            .live_queues()
            .into_iter()
            .find(|q| q.info.hw_channel_id == hw_channel_id)
            .ok_or(Error::NotFound)?;
        queue.write_fault.store(fault, Ordering::Release);
        Ok(())
    }

    /// Raise or clear the uncorrectable ECC flag
    pub fn set_ecc_error(&self, pending: bool) {
        self.gpu.ecc_pending.store(pending, Ordering::SeqCst);
    }

    /// Read a word, ignoring protection
    pub fn read_word(&self, va: GpuAddr) -> Result<u32> {
        self.gpu.space.read(va)
    }

    /// Write a word, ignoring protection
    pub fn write_word(&self, va: GpuAddr, value: u32) -> Result<()> {
        self.gpu.space.write(va, value)
    }

    /// Whether a GPU address is in protected memory
    pub fn is_protected(&self, va: GpuAddr) -> Result<bool> {
        self.gpu.space.is_protected(va)
    }
}

impl Device for SimDevice {
    type Memory = SimMemory;
    type QueueGroup = SimQueueGroup;
    type Queue = SimQueue;
    type Csl = SimCsl;

    fn id(&self) -> GpuId {
        self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn has_vidmem(&self) -> bool {
        self.config.has_vidmem
    }

    fn uses_proxy_channels(&self) -> bool {
        self.config.proxy_channels
    }

    fn conf_computing_enabled(&self) -> bool {
        self.config.conf_computing
    }

    fn ecc_enabled(&self) -> bool {
        self.config.ecc_enabled
    }

    fn ecc_error_pending(&self) -> bool {
        self.config.ecc_enabled && self.gpu.ecc_pending.load(Ordering::SeqCst)
    }

    fn copy_engine_caps(&self) -> Result<CopyEngineTable> {
        Ok(self.config.copy_engines.clone())
    }

    fn alloc_memory(&self, desc: &AllocDesc) -> Result<SimMemory> {
        if desc.location == BufferLocation::Vid && !self.config.has_vidmem {
            return Err(Error::NotSupported);
        }
        self.gpu
            .space
            .alloc(desc.size, desc.flags.contains(AllocFlags::PROTECTED))
    }

    fn alloc_queue_group(&self, engine: EngineType, index: u32) -> Result<SimQueueGroup> {
        if engine == EngineType::Sec2 && index >= self.sec2_engine_count() {
            return Err(Error::NotSupported);
        }
        if engine == EngineType::Ce && index as usize >= self.config.copy_engines.len() {
            return Err(Error::InvalidParameter);
        }
        Ok(SimQueueGroup { engine, index })
    }

    fn alloc_queue(&self, group: &SimQueueGroup, params: &QueueAllocParams) -> Result<SimQueue> {
        let entries = params.num_gpfifo_entries;
        if entries < 2 || !entries.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        if params.secure && !self.config.conf_computing {
            return Err(Error::NotSupported);
        }

        let gpfifo = self.alloc_memory(&AllocDesc {
            flags: if params.secure { AllocFlags::PROTECTED } else { AllocFlags::ZEROED },
            ..AllocDesc::new(
                "gpfifo",
                conduit_core::ByteSize::from_bytes(entries as u64 * 8),
                params.gpfifo_location,
            )
        })?;
        let gpput = self.alloc_memory(&AllocDesc {
            flags: if params.secure { AllocFlags::PROTECTED } else { AllocFlags::ZEROED },
            ..AllocDesc::new("gpput", conduit_core::ByteSize::from_bytes(4), params.gpput_location)
        })?;

        let id = self.gpu.next_channel.fetch_add(1, Ordering::Relaxed);
        let info = QueueInfo {
            hw_runlist_id: group.index,
            hw_channel_id: id,
            work_submission_token: id,
            gpfifo_gpu_va: crate::device::DeviceMemory::gpu_va(&gpfifo),
            gpput_gpu_va: crate::device::DeviceMemory::gpu_va(&gpput),
            num_gpfifo_entries: entries,
        };
        let keys = self
            .config
            .conf_computing
            .then(|| KeyCtx::new(((self.config.id.0 as u64) << 32) | id as u64));

        let state = Arc::new(QueueState::new(
            info,
            params.secure,
            params.proxy,
            gpfifo,
            gpput,
            keys,
            self.gpu.clone(),
        ));
        if let Ok(mut queues) = self.gpu.queues.write() {
            queues.retain(|q| q.strong_count() > 0);
            queues.push(Arc::downgrade(&state));
        }
        log::debug!(
            "sim: allocated {:?} queue {} with {} entries",
            group.engine,
            id,
            entries
        );
        Ok(SimQueue { state })
    }

    fn open_csl(&self, queue: &SimQueue) -> Result<SimCsl> {
        queue
            .state
            .keys
            .clone()
            .map(SimCsl::new)
            .ok_or(Error::NotSupported)
    }

    fn host_hal(&self) -> &dyn HostHal {
        &SimHost
    }

    fn ce_hal(&self) -> &dyn CeHal {
        &SimCe
    }

    fn sec2_hal(&self) -> &dyn Sec2Hal {
        &SimSec2
    }
}
