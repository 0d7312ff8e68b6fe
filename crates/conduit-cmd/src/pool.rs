//! # Channel Pools
//!
//! Channels sharing one engine instance. A pool's lock covers the GPFIFO
//! bookkeeping of all its channels; in secure mode a per-channel lock bit
//! and a counting gate admit one push per channel at a time.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use conduit_core::{AdmissionLock, CountingGate, Error, LockKind, Result};
use conduit_hal::{Device, EngineType, QueueAllocParams};

use crate::channel::Channel;
use crate::gpfifo::{ChannelRing, Retired};
use crate::manager::Shared;
use crate::secure::CryptoStats;

// =============================================================================
// POOL TYPE
// =============================================================================

/// Role of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolType {
    /// Copy engine channels
    Ce,
    /// Copy engine channel submitted through the device's proxy
    CeProxy,
    /// Security co-processor channels
    Sec2,
    /// Secure launch: decrypt-and-execute schedule
    Wlc,
    /// Secure launch: keeps the schedule primed
    Lcic,
}

impl PoolType {
    /// Short name
    pub const fn name(self) -> &'static str {
        match self {
            PoolType::Ce => "CE",
            PoolType::CeProxy => "PROXY",
            PoolType::Sec2 => "SEC2",
            PoolType::Wlc => "WLC",
            PoolType::Lcic => "LCIC",
        }
    }

    /// Whether the pool belongs to the secure launch pair
    pub const fn is_launch_pair(self) -> bool {
        matches!(self, PoolType::Wlc | PoolType::Lcic)
    }

    fn engine(self) -> EngineType {
        match self {
            PoolType::Sec2 => EngineType::Sec2,
            _ => EngineType::Ce,
        }
    }
}

bitflags! {
    /// Pool properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// Admission through the lock bitmap and gate
        const SECURE = 1 << 0;
        /// GPFIFO and GPPUT are out of the CPU's reach
        const PROTECTED_QUEUES = 1 << 1;
        /// Submissions go through the device's proxy
        const PROXY = 1 << 2;
        /// Tracking semaphores are encrypted
        const ENCRYPTED_TRACKING = 1 << 3;
    }
}

// =============================================================================
// POOL STATE
// =============================================================================

#[derive(Debug)]
pub(crate) struct PoolState {
    pub rings: Vec<ChannelRing>,
    /// Channels held by a push (secure pools)
    pub locked: u64,
}

#[derive(Debug)]
pub(crate) struct SecurePool {
    pub gate: CountingGate,
    pub rotation: AdmissionLock<()>,
}

/// Channels on one engine instance
pub struct ChannelPool<D: Device> {
    pub(crate) pool_type: PoolType,
    pub(crate) engine_index: u32,
    pub(crate) flags: PoolFlags,
    pub(crate) group: D::QueueGroup,
    pub(crate) channels: Vec<Channel<D>>,
    pub(crate) state: AdmissionLock<PoolState>,
    pub(crate) secure: Option<SecurePool>,
    pub(crate) stats: CryptoStats,
}

impl<D: Device> core::fmt::Debug for ChannelPool<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("type", &self.pool_type)
            .field("engine", &self.engine_index)
            .field("flags", &self.flags)
            .field("channels", &self.channels)
            .finish()
    }
}

impl<D: Device> ChannelPool<D> {
    /// Allocate a pool of `count` channels
    pub(crate) fn create(
        shared: &Shared<D>,
        pool_type: PoolType,
        engine_index: u32,
        count: u32,
    ) -> Result<Self> {
        let device = &shared.device;
        let cc = device.conf_computing_enabled();

        let mut flags = PoolFlags::empty();
        if cc {
            flags |= PoolFlags::SECURE;
        }
        if cc && matches!(pool_type, PoolType::Ce | PoolType::Wlc | PoolType::Lcic) {
            flags |= PoolFlags::PROTECTED_QUEUES;
        }
        if cc && matches!(pool_type, PoolType::Ce | PoolType::Wlc) {
            flags |= PoolFlags::ENCRYPTED_TRACKING;
        }
        if pool_type == PoolType::CeProxy {
            flags |= PoolFlags::PROXY;
        }

        let group = device.alloc_queue_group(pool_type.engine(), engine_index)?;
        let params = QueueAllocParams {
            num_gpfifo_entries: shared.config.num_gpfifo_entries,
            gpfifo_location: shared.config.gpfifo_location,
            gpput_location: shared.config.gpput_location,
            secure: flags.contains(PoolFlags::PROTECTED_QUEUES),
            proxy: flags.contains(PoolFlags::PROXY),
        };

        let mut channels = Vec::with_capacity(count as usize);
        let mut rings = Vec::with_capacity(count as usize);
        for index in 0..count as usize {
            let queue = device.alloc_queue(&group, &params)?;
            let tracking =
                shared.alloc_tracking(flags.contains(PoolFlags::ENCRYPTED_TRACKING))?;
            let mut channel = Channel::new(pool_type, engine_index, index, queue, tracking);
            if cc {
                let csl = Arc::new(device.open_csl(&channel.queue)?);
                if pool_type == PoolType::Ce {
                    channel.tracking_csl = Some(csl.clone());
                }
                channel.csl = Some(csl);
            }
            log::debug!(
                "created channel {} (hw {}) with {} entries",
                channel.name,
                channel.queue_info().hw_channel_id,
                params.num_gpfifo_entries
            );
            channels.push(channel);
            rings.push(ChannelRing::new(params.num_gpfifo_entries)?);
        }

        let lock_kind = if cc { LockKind::Sleep } else { LockKind::Spin };
        let secure = cc.then(|| SecurePool {
            gate: CountingGate::new(count),
            rotation: AdmissionLock::new(LockKind::Sleep, ()),
        });

        log::info!(
            "{} pool on engine {}: {} channels{}",
            pool_type.name(),
            engine_index,
            count,
            if cc { " (secure)" } else { "" }
        );

        Ok(Self {
            pool_type,
            engine_index,
            flags,
            group,
            channels,
            state: AdmissionLock::new(lock_kind, PoolState { rings, locked: 0 }),
            secure,
            stats: CryptoStats::default(),
        })
    }

    /// Role of the pool
    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    /// Engine instance
    pub fn engine_index(&self) -> u32 {
        self.engine_index
    }

    /// Pool properties
    pub fn flags(&self) -> PoolFlags {
        self.flags
    }

    /// Queue group the channels were allocated in
    pub fn queue_group(&self) -> &D::QueueGroup {
        &self.group
    }

    /// Channels of the pool
    pub fn channels(&self) -> &[Channel<D>] {
        &self.channels
    }

    /// Crypto accounting
    pub fn crypto_stats(&self) -> &CryptoStats {
        &self.stats
    }

    /// Whether admission goes through the lock bitmap and gate
    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    // =========================================================================
    // Reservation
    // =========================================================================

    /// Claim `count` GPFIFO slots on some channel of the pool
    ///
    /// In a secure pool the channel is also locked for one push.
    pub(crate) fn reserve(&self, shared: &Shared<D>, count: u32) -> Result<usize> {
        if count == 0 || count > shared.config.num_gpfifo_entries {
            return Err(Error::InvalidParameter);
        }
        shared.ctx.status()?;

        let Some(secure) = &self.secure else {
            let mut spin = shared.ctx.spin_loop("channel reservation");
            loop {
                {
                    let mut state = self.state.lock();
                    for (index, ring) in state.rings.iter_mut().enumerate() {
                        if ring.try_claim(count) {
                            return Ok(index);
                        }
                    }
                }
                self.update_progress_all(shared)?;
                self.check_errors_all(shared)?;
                shared.ctx.status()?;
                spin.spin()?;
            }
        };

        if count != 1 {
            return Err(Error::InvalidParameter);
        }

        let mut spin = shared.ctx.spin_loop("secure channel admission");
        while !secure.gate.try_acquire() {
            self.check_errors_all(shared)?;
            shared.ctx.status()?;
            spin.spin()?;
        }

        loop {
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let launch = self.pool_type.is_launch_pair();
                for (index, ring) in state.rings.iter_mut().enumerate() {
                    let bit = 1u64 << index;
                    if state.locked & bit == 0 && (launch || ring.try_claim(1)) {
                        state.locked |= bit;
                        return Ok(index);
                    }
                }
            }
            let waited = self
                .update_progress_all(shared)
                .and_then(|_| self.check_errors_all(shared))
                .and_then(|_| shared.ctx.status())
                .and_then(|_| spin.spin());
            if let Err(err) = waited {
                secure.gate.release();
                return Err(err);
            }
        }
    }

    /// Claim `count` GPFIFO slots on one particular channel
    ///
    /// A secure pool only hands out a single slot together with the
    /// channel lock.
    pub(crate) fn reserve_channel(&self, shared: &Shared<D>, index: usize, count: u32) -> Result<()> {
        if count == 0 || count > shared.config.num_gpfifo_entries || index >= self.channels.len() {
            return Err(Error::InvalidParameter);
        }

        let Some(secure) = &self.secure else {
            return shared.ctx.wait_until("channel reservation", || {
                if self.state.lock().rings[index].try_claim(count) {
                    return Ok(true);
                }
                self.update_progress(shared, index, false)?;
                self.check_errors(shared, index)?;
                Ok(false)
            });
        };

        if count != 1 {
            return Err(Error::InvalidParameter);
        }

        let mut spin = shared.ctx.spin_loop("secure channel admission");
        while !secure.gate.try_acquire() {
            self.check_errors_all(shared)?;
            shared.ctx.status()?;
            spin.spin()?;
        }

        let launch = self.pool_type.is_launch_pair();
        let bit = 1u64 << index;
        let result = shared.ctx.wait_until("channel reservation", || {
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.locked & bit == 0 && (launch || state.rings[index].try_claim(1)) {
                    state.locked |= bit;
                    return Ok(true);
                }
            }
            self.update_progress(shared, index, false)?;
            self.check_errors(shared, index)?;
            Ok(false)
        });
        if result.is_err() {
            secure.gate.release();
        }
        result
    }

    /// Give back claimed slots and, for a secure pool, the channel lock
    pub(crate) fn release(&self, index: usize, count: u32) {
        {
            let mut state = self.state.lock();
            if !self.pool_type.is_launch_pair() {
                state.rings[index].unclaim(count);
            }
            Self::unlock(&mut state, index);
        }
        self.release_gate();
    }

    /// Clear a channel's lock bit; callers hold the pool lock
    pub(crate) fn unlock(state: &mut PoolState, index: usize) {
        state.locked &= !(1u64 << index);
    }

    /// Return one admission unit
    pub(crate) fn release_gate(&self) {
        if let Some(secure) = &self.secure {
            secure.gate.release();
        }
    }

    /// Free GPFIFO slots of a channel
    pub fn available_slots(&self, index: usize) -> u32 {
        self.state.lock().rings[index].available()
    }

    // =========================================================================
    // Progress
    // =========================================================================

    /// Retire completed entries of one channel
    ///
    /// Retires at most one batch unless `force` is set, in which case every
    /// pending entry is retired whether complete or not. Completion
    /// callbacks run after the pool lock is dropped. Returns the number of
    /// entries still pending.
    pub(crate) fn update_progress(&self, shared: &Shared<D>, index: usize, force: bool) -> Result<u32> {
        let channel = &self.channels[index];
        let completed = match channel
            .tracking
            .update_completed(channel.secure_read(&self.stats))
        {
            Ok(value) => value,
            Err(err) if force => {
                log::warn!("{}: forcing progress past {}", channel.name, err);
                channel.tracking.completed()
            }
            Err(err) => return Err(self.escalate(shared, index, err)),
        };

        let max = if force { u32::MAX } else { shared.config.progress_batch };
        let mut retired: Vec<Retired> = Vec::new();
        let pending = {
            let mut state = self.state.lock();
            let ring = &mut state.rings[index];
            while (retired.len() as u32) < max {
                let Some(entry) = ring.retire_next(completed, force) else {
                    break;
                };
                if let Some(token) = entry.token {
                    shared.pushbuffer.mark_completed(token);
                }
                retired.push(entry);
            }
            ring.pending()
        };

        for entry in retired {
            if let Some(callback) = entry.callback {
                callback();
            }
        }
        Ok(pending)
    }

    /// Retire completed entries of every channel; returns entries pending
    pub(crate) fn update_progress_all(&self, shared: &Shared<D>) -> Result<u32> {
        let mut pending = 0;
        for index in 0..self.channels.len() {
            pending += self.update_progress(shared, index, false)?;
        }
        Ok(pending)
    }

    // =========================================================================
    // Errors and waiting
    // =========================================================================

    /// Check a channel for errors, escalating any to the fatal condition
    pub(crate) fn check_errors(&self, shared: &Shared<D>, index: usize) -> Result<()> {
        match self.channels[index].get_status(&shared.device) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.escalate(shared, index, err);
                Err(err)
            }
        }
    }

    /// Check every channel of the pool
    pub(crate) fn check_errors_all(&self, shared: &Shared<D>) -> Result<()> {
        for index in 0..self.channels.len() {
            self.check_errors(shared, index)?;
        }
        Ok(())
    }

    /// Log the error with the provenance of the oldest pending push and
    /// record it as fatal
    pub(crate) fn escalate(&self, shared: &Shared<D>, index: usize, err: Error) -> Error {
        let channel = &self.channels[index];
        log::error!(
            "detected {} on channel {} (hw {}) of {}",
            err,
            channel.name,
            channel.queue_info().hw_channel_id,
            shared.device.name()
        );

        if let Some(state) = self.state.try_lock() {
            let ring = &state.rings[index];
            match ring.oldest_pending() {
                Some(crate::gpfifo::GpfifoEntry::Push { info, tracking_value, .. }) => {
                    if let Some(info) = ring.info(*info) {
                        log::error!(
                            "error likely caused by push {} (tracking value {})",
                            info,
                            tracking_value
                        );
                    }
                }
                Some(crate::gpfifo::GpfifoEntry::Control { payload, .. }) => {
                    log::error!("error likely caused by control entry {:#x}", payload);
                }
                _ => {}
            }
        }

        shared.ctx.set_fatal(err)
    }

    /// Wait until everything queued on a channel so far has completed
    pub(crate) fn wait(&self, shared: &Shared<D>, index: usize) -> Result<()> {
        let target = self.channels[index].tracking.queued();
        self.wait_for(shared, index, target)
    }

    /// Wait until a channel's tracking value reaches `value`
    pub(crate) fn wait_for(&self, shared: &Shared<D>, index: usize, value: u64) -> Result<()> {
        let channel = &self.channels[index];
        shared.ctx.wait_until("channel wait", || {
            self.update_progress(shared, index, false)?;
            if channel.tracking.is_value_completed(value) {
                return Ok(true);
            }
            self.check_errors(shared, index)?;
            Ok(false)
        })
    }
}
