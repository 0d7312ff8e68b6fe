//! # Channel Manager
//!
//! Owns every channel pool of one GPU together with the resources they
//! share: the pushbuffer, the tracking semaphore pools and the fatal error
//! state.
//!
//! ## Pools
//!
//! ```text
//!   CE pools         one per usable copy engine, in engine order
//!   proxy pool       MEMOPS through the device's proxy (virtualized)
//!   SEC2 pool        confidential computing only
//!   WLC / LCIC       confidential computing only, paired by index
//! ```
//!
//! ## Lock order
//!
//! CE pool, then SEC2 or WLC pool, then the pushbuffer. Admission units of
//! a pool and of the pushbuffer are returned after the pool lock is dropped.

use alloc::vec::Vec;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, Ordering, fence};

use hashbrown::HashMap;

use conduit_core::{BufferLocation, Error, GpuId, Result};
use conduit_hal::{Device, HwQueue, QueueInfo, MAX_COPY_ENGINES};

use crate::ce_select::{CeSelection, select_copy_engines};
use crate::channel::{Channel, ChannelType};
use crate::config::{ChannelManagerConfig, MAX_PUSH_SIZE};
use crate::context::Context;
use crate::gpfifo::{GpfifoEntry, RingStats};
use crate::pool::{ChannelPool, PoolFlags, PoolType};
use crate::push::Push;
use crate::pushbuffer::{Pushbuffer, PushbufferStats};
use crate::secure::{CryptoStatsSnapshot, LaunchSlots};
use crate::semaphore::{MIRROR_WORDS, SemaphorePool, TrackingSemaphore};

// =============================================================================
// SHARED STATE
// =============================================================================

/// Resources every pool draws from
pub(crate) struct Shared<D: Device> {
    pub device: D,
    pub ctx: Context,
    pub config: ChannelManagerConfig,
    pub pushbuffer: Pushbuffer<D::Memory>,
    plain_sems: SemaphorePool<D::Memory>,
    protected_sems: SemaphorePool<D::Memory>,
    mirror_sems: SemaphorePool<D::Memory>,
}

impl<D: Device> Shared<D> {
    /// Allocate a channel's tracking semaphore
    pub fn alloc_tracking(&self, encrypted: bool) -> Result<TrackingSemaphore<D::Memory>> {
        let entries = self.config.num_gpfifo_entries;
        if encrypted {
            let payload = self.protected_sems.alloc(&self.device)?;
            let mirror = self.mirror_sems.alloc(&self.device)?;
            Ok(TrackingSemaphore::new_secure(payload, mirror, entries as u64, entries))
        } else {
            let payload = self.plain_sems.alloc(&self.device)?;
            Ok(TrackingSemaphore::new(payload, entries as u64))
        }
    }

    /// Return a channel's tracking semaphore slots to their pools
    pub fn free_tracking(&self, tracking: TrackingSemaphore<D::Memory>) {
        match tracking.into_slots() {
            (payload, Some(mirror)) => {
                self.protected_sems.free(payload);
                self.mirror_sems.free(mirror);
            }
            (payload, None) => self.plain_sems.free(payload),
        }
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Position of a channel within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub(crate) pool: usize,
    pub(crate) index: usize,
}

impl ChannelId {
    pub(crate) const fn new(pool: usize, index: usize) -> Self {
        Self { pool, index }
    }

    /// Pool index
    pub fn pool(&self) -> usize {
        self.pool
    }

    /// Channel index within the pool
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Borrowed view of one channel
pub struct ChannelRef<'a, D: Device> {
    manager: &'a ChannelManager<D>,
    id: ChannelId,
}

impl<D: Device> Clone for ChannelRef<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Device> Copy for ChannelRef<'_, D> {}

impl<'a, D: Device> ChannelRef<'a, D> {
    pub(crate) fn new(manager: &'a ChannelManager<D>, id: ChannelId) -> Self {
        Self { manager, id }
    }

    fn pool(&self) -> &'a ChannelPool<D> {
        &self.manager.pools[self.id.pool]
    }

    /// Position within the manager
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The channel itself
    pub fn channel(&self) -> &'a Channel<D> {
        &self.pool().channels[self.id.index]
    }

    /// Channel name
    pub fn name(&self) -> &'a str {
        self.channel().name()
    }

    /// Role of the owning pool
    pub fn pool_type(&self) -> PoolType {
        self.pool().pool_type
    }

    /// Hardware queue description
    pub fn queue_info(&self) -> &'a QueueInfo {
        self.channel().queue_info()
    }

    /// Address of the tracking semaphore payload
    pub fn tracking_gpu_va(&self) -> conduit_core::GpuAddr {
        self.channel().tracking_gpu_va()
    }

    /// Last tracking value handed out
    pub fn queued(&self) -> u64 {
        self.channel().tracking.queued()
    }

    /// Cached completed tracking value
    pub fn completed(&self) -> u64 {
        self.channel().tracking.completed()
    }

    /// Whether `value` has completed
    ///
    /// Reads the tracking semaphore when the cached counter is behind. A
    /// read error becomes the fatal condition and reports `false`.
    pub fn is_value_completed(&self, value: u64) -> bool {
        let pool = self.pool();
        let channel = self.channel();
        match channel
            .tracking
            .poll_value_completed(value, channel.secure_read(&pool.stats))
        {
            Ok(done) => done,
            Err(err) => {
                pool.escalate(&self.manager.shared, self.id.index, err);
                false
            }
        }
    }

    /// Free GPFIFO slots
    pub fn available_slots(&self) -> u32 {
        self.pool().available_slots(self.id.index)
    }

    /// GPFIFO counters
    pub fn ring_stats(&self) -> RingStats {
        self.pool().state.lock().rings[self.id.index].stats()
    }

    /// Retire completed entries; returns the number still pending
    pub fn update_progress(&self) -> Result<u32> {
        self.pool().update_progress(&self.manager.shared, self.id.index, false)
    }

    /// Wait for everything queued so far
    pub fn wait(&self) -> Result<()> {
        self.pool().wait(&self.manager.shared, self.id.index)
    }

    /// Wait for a tracking value
    pub fn wait_for(&self, value: u64) -> Result<()> {
        self.pool().wait_for(&self.manager.shared, self.id.index, value)
    }

    /// Check the channel for errors; an error becomes the fatal condition
    pub fn check_errors(&self) -> Result<()> {
        self.pool().check_errors(&self.manager.shared, self.id.index)
    }

    /// Health of the channel, without escalating
    pub fn get_status(&self) -> Result<()> {
        self.channel().get_status(&self.manager.shared.device)
    }

    /// Submit an opaque GPFIFO control entry
    ///
    /// The entry is followed by an empty push carrying the tracking release
    /// for both. Not available on secure or proxy channels.
    #[track_caller]
    pub fn write_control_entry(&self, payload: u64) -> Result<()> {
        let location = Location::caller();
        let manager = self.manager;
        let shared = &manager.shared;
        let pool = self.pool();
        if pool.flags.intersects(PoolFlags::SECURE | PoolFlags::PROXY) {
            return Err(Error::NotSupported);
        }

        pool.reserve_channel(shared, self.id.index, 2)?;
        let channel = self.channel();
        let written = {
            let mut state = pool.state.lock();
            let ring = &mut state.rings[self.id.index];
            let value = channel.tracking.queued() + 1;
            match ring.commit(GpfifoEntry::Control {
                payload,
                tracking_value: value,
            }) {
                Ok(slot) => {
                    let put = ring.put().raw();
                    fence(Ordering::SeqCst);
                    channel
                        .queue
                        .write_gpfifo_entry(slot.raw(), payload)
                        .and_then(|_| {
                            fence(Ordering::Release);
                            channel.queue.write_gpu_put(put)
                        })
                }
                Err(err) => {
                    ring.unclaim(2);
                    return Err(err);
                }
            }
        };
        if let Err(err) = written {
            // The release push never comes; give its slot back
            pool.state.lock().rings[self.id.index].unclaim(1);
            let err = if err.is_fatal() { err } else { Error::ChannelError };
            return Err(pool.escalate(shared, self.id.index, err));
        }

        log::debug!("{}: control entry {:#x}", channel.name, payload);
        Push::begin(manager, self.id, 0, "control entry", location)?.end()?;
        Ok(())
    }
}

impl<D: Device> core::fmt::Debug for ChannelRef<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self.channel(), f)
    }
}

/// GPFIFO slots held on one channel
///
/// Each [`Reservation::begin_push`] consumes one slot; slots still held
/// when the reservation is dropped are given back.
pub struct Reservation<'a, D: Device> {
    manager: &'a ChannelManager<D>,
    id: ChannelId,
    remaining: u32,
}

impl<'a, D: Device> Reservation<'a, D> {
    pub(crate) fn new(manager: &'a ChannelManager<D>, id: ChannelId, count: u32) -> Self {
        Self {
            manager,
            id,
            remaining: count,
        }
    }

    /// Reserved channel
    pub fn channel(&self) -> ChannelRef<'a, D> {
        ChannelRef::new(self.manager, self.id)
    }

    /// Slots not yet used
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Begin a push of up to the maximum push size
    #[track_caller]
    pub fn begin_push(&mut self, description: &str) -> Result<Push<'a, D>> {
        let location = Location::caller();
        self.begin_push_at(MAX_PUSH_SIZE.as_bytes() as u32, description, location)
    }

    /// Begin a push of at most `bytes` bytes
    #[track_caller]
    pub fn begin_push_sized(&mut self, bytes: u32, description: &str) -> Result<Push<'a, D>> {
        let location = Location::caller();
        self.begin_push_at(bytes, description, location)
    }

    pub(crate) fn begin_push_at(
        &mut self,
        bytes: u32,
        description: &str,
        location: &'static Location<'static>,
    ) -> Result<Push<'a, D>> {
        if self.remaining == 0 {
            return Err(Error::InvalidState);
        }
        self.remaining -= 1;
        Push::begin(self.manager, self.id, bytes, description, location)
    }
}

impl<D: Device> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.manager.pools[self.id.pool].release(self.id.index, self.remaining);
        }
    }
}

// =============================================================================
// CHANNEL MANAGER
// =============================================================================

/// All channels of one GPU
pub struct ChannelManager<D: Device> {
    /// Dropped before `shared`, which owns the device
    pub(crate) pools: Vec<ChannelPool<D>>,
    pub(crate) shared: Shared<D>,
    selection: CeSelection,
    /// Pool of each logical copy engine
    ce_pools: [Option<usize>; MAX_COPY_ENGINES],
    /// Pool serving each copy engine channel type
    type_pools: [Option<usize>; ChannelType::CE_TYPES.len()],
    proxy_index: Option<usize>,
    pub(crate) sec2_index: Option<usize>,
    pub(crate) wlc_index: Option<usize>,
    lcic_index: Option<usize>,
    /// Copy engine overrides for peer copies
    p2p: spin::Mutex<HashMap<GpuId, usize>>,
    pub(crate) wlc_ready: AtomicBool,
}

impl<D: Device> ChannelManager<D> {
    /// Create every pool and bring the channels up
    pub fn new(device: D, mut config: ChannelManagerConfig) -> Result<Self> {
        let secure = device.conf_computing_enabled();
        if secure && device.uses_proxy_channels() {
            log::error!("{}: proxy channels with confidential computing", device.name());
            return Err(Error::NotSupported);
        }
        config.normalize(device.has_vidmem(), secure);

        let table = device.copy_engine_caps()?;
        let selection = select_copy_engines(&table, secure)?;
        let pushbuffer = Pushbuffer::new(&device, &config, secure)?;

        let shared = Shared {
            ctx: Context::new(config.spin),
            pushbuffer,
            plain_sems: SemaphorePool::new("tracking", 1, BufferLocation::Sys, false),
            protected_sems: SemaphorePool::new("tracking payload", 1, BufferLocation::Vid, true),
            mirror_sems: SemaphorePool::new("tracking mirror", MIRROR_WORDS, BufferLocation::Sys, false),
            config,
            device,
        };

        let mut manager = Self {
            pools: Vec::new(),
            shared,
            selection,
            ce_pools: [None; MAX_COPY_ENGINES],
            type_pools: [None; ChannelType::CE_TYPES.len()],
            proxy_index: None,
            sec2_index: None,
            wlc_index: None,
            lcic_index: None,
            p2p: spin::Mutex::new(HashMap::new()),
            wlc_ready: AtomicBool::new(false),
        };
        manager.create_pools()?;
        manager.init_channels()?;
        if secure {
            manager.setup_launch_pairs()?;
        }

        log::info!(
            "channel manager for {}: {} pools, {} GPFIFO entries, CE mask {:#x}{}",
            manager.shared.device.name(),
            manager.pools.len(),
            manager.shared.config.num_gpfifo_entries,
            manager.selection.usable_mask,
            if secure { ", secure" } else { "" }
        );
        Ok(manager)
    }

    fn add_pool(&mut self, pool_type: PoolType, engine: u32, count: u32) -> Result<usize> {
        let pool = ChannelPool::create(&self.shared, pool_type, engine, count)?;
        self.pools.push(pool);
        Ok(self.pools.len() - 1)
    }

    fn create_pools(&mut self) -> Result<()> {
        let per_pool = self.shared.config.channels_per_pool;
        for ce in 0..MAX_COPY_ENGINES as u32 {
            if self.selection.usable_mask & (1 << ce) != 0 {
                self.ce_pools[ce as usize] = Some(self.add_pool(PoolType::Ce, ce, per_pool)?);
            }
        }
        for (slot, ce) in self.selection.preferred.iter().enumerate() {
            self.type_pools[slot] = self.ce_pools[*ce as usize];
        }

        let memops_ce = self.selection.preferred[ChannelType::Memops.ce_slot().unwrap_or(4)];
        if self.shared.device.uses_proxy_channels() {
            let proxy = self.add_pool(PoolType::CeProxy, memops_ce, 1)?;
            self.proxy_index = Some(proxy);
            if let Some(slot) = ChannelType::Memops.ce_slot() {
                self.type_pools[slot] = Some(proxy);
            }
        }

        if self.shared.device.conf_computing_enabled() {
            if self.shared.device.sec2_engine_count() == 0 {
                return Err(Error::NotSupported);
            }
            self.sec2_index = Some(self.add_pool(PoolType::Sec2, 0, per_pool)?);

            let pairs = self.shared.config.launch_pair_channels;
            let wlc = self.add_pool(PoolType::Wlc, memops_ce, pairs)?;
            let lcic = self.add_pool(PoolType::Lcic, memops_ce, pairs)?;
            for index in 0..pairs as usize {
                let slots = LaunchSlots::new(&self.shared.device)?;
                let lcic_csl = self.pools[lcic].channels[index].csl.clone();
                let w = &mut self.pools[wlc].channels[index];
                w.launch = Some(slots);
                w.tracking_csl = lcic_csl;
            }
            self.wlc_index = Some(wlc);
            self.lcic_index = Some(lcic);
        }
        Ok(())
    }

    /// Run the init push on every channel the CPU submits to
    fn init_channels(&self) -> Result<()> {
        let mut order: Vec<usize> = self.sec2_index.into_iter().collect();
        order.extend(
            (0..self.pools.len())
                .filter(|i| !self.pools[*i].pool_type.is_launch_pair() && Some(*i) != self.sec2_index),
        );

        for pool_index in order {
            let pool = &self.pools[pool_index];
            for index in 0..pool.channels.len() {
                pool.reserve_channel(&self.shared, index, 1)?;
                let mut reservation = Reservation::new(self, ChannelId::new(pool_index, index), 1);
                let mut push = reservation.begin_push("init channel")?;
                push.host().init(&mut push)?;
                match pool.pool_type {
                    PoolType::Sec2 => push.sec2().init(&mut push)?,
                    _ => push.ce().init(&mut push)?,
                }
                push.end()?;
            }
        }
        self.wait()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The device
    pub fn device(&self) -> &D {
        &self.shared.device
    }

    /// Effective configuration
    pub fn config(&self) -> &ChannelManagerConfig {
        &self.shared.config
    }

    /// Whether confidential computing is on
    pub fn is_secure(&self) -> bool {
        self.shared.pushbuffer.is_secure()
    }

    /// Whether protected pushes launch through WLC
    pub fn is_secure_launch_ready(&self) -> bool {
        self.wlc_ready.load(Ordering::Acquire)
    }

    /// All pools, in creation order
    pub fn pools(&self) -> &[ChannelPool<D>] {
        &self.pools
    }

    pub(crate) fn wlc_pool(&self) -> Option<&ChannelPool<D>> {
        self.wlc_index.map(|i| &self.pools[i])
    }

    pub(crate) fn lcic_pool(&self) -> Option<&ChannelPool<D>> {
        self.lcic_index.map(|i| &self.pools[i])
    }

    /// Copy engine serving a channel type
    pub fn ce_for(&self, ty: ChannelType) -> Option<u32> {
        self.selection.ce_for(ty)
    }

    /// Usable copy engines
    pub fn ce_mask(&self) -> u32 {
        self.selection.usable_mask
    }

    /// Every channel
    pub fn channels(&self) -> impl Iterator<Item = ChannelRef<'_, D>> {
        self.pools.iter().enumerate().flat_map(move |(pool, p)| {
            (0..p.channels.len()).map(move |index| ChannelRef::new(self, ChannelId::new(pool, index)))
        })
    }

    /// Channels serving a type
    pub fn channels_of(&self, ty: ChannelType) -> Result<Vec<ChannelRef<'_, D>>> {
        let pool = match ty {
            ChannelType::Wlc => self.wlc_index.ok_or(Error::NotSupported)?,
            ChannelType::Lcic => self.lcic_index.ok_or(Error::NotSupported)?,
            _ => self.pool_for_type(ty)?,
        };
        Ok((0..self.pools[pool].channels.len())
            .map(|index| ChannelRef::new(self, ChannelId::new(pool, index)))
            .collect())
    }

    /// Summed crypto accounting of every pool of a type
    pub fn crypto_stats(&self, pool_type: PoolType) -> CryptoStatsSnapshot {
        self.pools
            .iter()
            .filter(|p| p.pool_type == pool_type)
            .map(|p| p.stats.snapshot())
            .fold(CryptoStatsSnapshot::default(), |acc, s| acc + s)
    }

    /// Pushbuffer counters
    pub fn pushbuffer_stats(&self) -> PushbufferStats {
        self.shared.pushbuffer.stats()
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// The recorded fatal error, as a result
    pub fn status(&self) -> Result<()> {
        self.shared.ctx.status()
    }

    /// The recorded fatal error
    pub fn fatal_error(&self) -> Option<Error> {
        self.shared.ctx.fatal_error()
    }

    /// Forget the fatal error; the channels stay in whatever state they are
    pub fn clear_fatal_error(&self) -> Option<Error> {
        self.shared.ctx.clear_fatal()
    }

    /// Check every channel and the device ECC state
    pub fn check_errors(&self) -> Result<()> {
        self.status()?;
        for pool in &self.pools {
            for index in 0..pool.channels.len() {
                pool.check_errors(&self.shared, index)?;
            }
        }
        let device = &self.shared.device;
        if device.ecc_enabled() && device.ecc_error_pending() {
            log::error!("{}: uncorrectable ECC error pending", device.name());
            return Err(self.shared.ctx.set_fatal(Error::EccError));
        }
        Ok(())
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    fn pool_for_type(&self, ty: ChannelType) -> Result<usize> {
        match ty {
            ChannelType::Sec2 => self.sec2_index.ok_or(Error::NotSupported),
            ChannelType::Wlc | ChannelType::Lcic => Err(Error::InvalidParameter),
            _ => ty
                .ce_slot()
                .and_then(|slot| self.type_pools[slot])
                .ok_or(Error::NotSupported),
        }
    }

    /// Reserve slots in a pool, rotating its keys first if due
    pub(crate) fn reserve_in_pool(&self, pool: usize, count: u32) -> Result<ChannelId> {
        let p = &self.pools[pool];
        if p.is_secure() && p.stats.rotation_due(self.shared.config.key_rotation_threshold) {
            self.rotate_pool(pool, false)?;
        }
        let index = p.reserve(&self.shared, count)?;
        Ok(ChannelId::new(pool, index))
    }

    pub(crate) fn reserve_pool(&self, pool: usize, count: u32) -> Result<Reservation<'_, D>> {
        let id = self.reserve_in_pool(pool, count)?;
        Ok(Reservation::new(self, id, count))
    }

    /// Reserve one GPFIFO slot on a channel of the given type
    pub fn reserve(&self, ty: ChannelType) -> Result<Reservation<'_, D>> {
        self.reserve_count(ty, 1)
    }

    /// Reserve `count` GPFIFO slots on one channel of the given type
    ///
    /// Blocks until a channel has room. Secure channels hand out one slot
    /// at a time.
    pub fn reserve_count(&self, ty: ChannelType, count: u32) -> Result<Reservation<'_, D>> {
        let pool = self.pool_for_type(ty)?;
        self.reserve_pool(pool, count)
    }

    /// Reserve a channel for copies to `peer`
    pub fn reserve_peer(&self, peer: GpuId) -> Result<Reservation<'_, D>> {
        let pool = self.p2p.lock().get(&peer).copied();
        match pool {
            Some(pool) => self.reserve_pool(pool, 1),
            None => self.reserve(ChannelType::GpuToGpu),
        }
    }

    /// Send copies to `peer` through a specific copy engine
    pub fn set_p2p_ce(&self, peer: GpuId, ce: u32) -> Result<()> {
        let pool = self
            .ce_pools
            .get(ce as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidParameter)?;
        self.p2p.lock().insert(peer, pool);
        log::debug!("{}: copies to {} use CE{}", self.shared.device.name(), peer, ce);
        Ok(())
    }

    /// Drop a peer override
    pub fn clear_p2p_ce(&self, peer: GpuId) {
        self.p2p.lock().remove(&peer);
    }

    /// Reserve a channel and begin a push on it
    #[track_caller]
    pub fn push_begin(&self, ty: ChannelType, description: &str) -> Result<Push<'_, D>> {
        let location = Location::caller();
        let mut reservation = self.reserve(ty)?;
        reservation.begin_push_at(MAX_PUSH_SIZE.as_bytes() as u32, description, location)
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Retire completed work everywhere; returns entries still pending
    pub fn update_progress(&self) -> Result<u32> {
        let mut pending = 0;
        for pool in &self.pools {
            pending += pool.update_progress_all(&self.shared)?;
        }
        Ok(pending)
    }

    /// Wait for everything queued so far on every channel
    ///
    /// Fails with the recorded fatal error without waiting once one exists.
    pub fn wait(&self) -> Result<()> {
        self.status()?;
        for pool in &self.pools {
            for index in 0..pool.channels.len() {
                pool.wait(&self.shared, index)?;
            }
        }
        self.check_errors()
    }

    fn teardown(&mut self) {
        if self.pools.is_empty() {
            return;
        }
        if self.status().is_ok() {
            if let Err(err) = self.wait().and_then(|_| self.drain_launch_pairs()) {
                log::warn!("{}: teardown wait failed: {}", self.shared.device.name(), err);
            }
        } else {
            log::warn!(
                "{}: tearing down after {:?}, pending work is dropped",
                self.shared.device.name(),
                self.fatal_error()
            );
        }

        for pool in self.pools.iter().rev() {
            for index in 0..pool.channels.len() {
                let _ = pool.update_progress(&self.shared, index, true);
            }
        }
        for pool in self.pools.drain(..).rev() {
            for channel in pool.channels {
                self.shared.free_tracking(channel.tracking);
            }
        }

        let stats = self.pushbuffer_stats();
        log::info!(
            "channel manager for {} destroyed ({} pushes, {} retired)",
            self.shared.device.name(),
            stats.pushes_started,
            stats.pushes_completed
        );
    }
}

impl<D: Device> Drop for ChannelManager<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: Device> core::fmt::Debug for ChannelManager<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("device", &self.shared.device.name())
            .field("pools", &self.pools)
            .field("pushbuffer", &self.shared.pushbuffer)
            .field("fatal", &self.fatal_error())
            .finish()
    }
}

#[cfg(test)]
mod tests;
