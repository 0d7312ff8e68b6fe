//! # Pushes
//!
//! A push is a run of methods written into pushbuffer space and submitted
//! to one channel as a single GPFIFO entry.
//!
//! ```text
//!   begin ─► methods ─► end
//!     │                  ├─ tracking release (value = queued + 1)
//!     │                  ├─ GPFIFO entry committed, pushbuffer span closed
//!     │                  └─ submit: direct / proxy / indirect launch
//!     └─ slot reserved, pushbuffer span claimed, launch channel taken
//! ```
//!
//! A push that is dropped without [`Push::end`] is ended on drop.

use alloc::vec::Vec;
use core::panic::Location;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use conduit_core::{Error, GpuAddr, Result};
use conduit_hal::{CeHal, CslContext, CslIv, Device, HostHal, HwQueue, MethodSink, Sec2Hal, TRAILER_WORDS};

use crate::config::MAX_PUSH_SIZE;
use crate::gpfifo::{GpfifoEntry, PushInfo};
use crate::manager::{ChannelId, ChannelManager, ChannelRef};
use crate::pool::{ChannelPool, PoolFlags, PoolState, PoolType};
use crate::pushbuffer::{PushSpan, PushTarget};
use crate::secure::{Handoff, Launch};

/// Methods being recorded for one channel
pub struct Push<'a, D: Device> {
    pub(crate) manager: &'a ChannelManager<D>,
    pub(crate) id: ChannelId,
    pub(crate) span: PushSpan,
    pub(crate) target: PushTarget,
    pub(crate) words: &'a [AtomicU32],
    pub(crate) cursor: usize,
    /// Words the caller may write
    limit: usize,
    /// Words available to the closing methods
    capacity: usize,
    info_slot: u32,
    launch: Option<Launch<'a, D>>,
    on_complete: Option<crate::gpfifo::CompletionCallback>,
    ended: bool,
}

impl<'a, D: Device> Push<'a, D> {
    /// Start a push on a channel the caller holds one slot (and, for a
    /// secure pool, the lock) of
    ///
    /// The slot is given back on failure.
    pub(crate) fn begin(
        manager: &'a ChannelManager<D>,
        id: ChannelId,
        bytes: u32,
        description: &str,
        location: &'static Location<'static>,
    ) -> Result<Self> {
        let shared = &manager.shared;
        let pool = &manager.pools[id.pool];

        if bytes as u64 > MAX_PUSH_SIZE.as_bytes() {
            pool.release(id.index, 1);
            return Err(Error::PushTooLarge);
        }
        if let Err(err) = shared.ctx.status() {
            pool.release(id.index, 1);
            return Err(err);
        }

        let protected = pool.flags.contains(PoolFlags::PROTECTED_QUEUES);
        let launch = if protected && pool.pool_type == PoolType::Ce {
            match manager.begin_launch() {
                Ok(launch) => Some(launch),
                Err(err) => {
                    pool.release(id.index, 1);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let pushbuffer = &shared.pushbuffer;
        let span = match pushbuffer.begin_push(&shared.ctx, &mut || manager.update_progress().map(drop)) {
            Ok(span) => span,
            Err(err) => {
                if let Some(launch) = launch {
                    launch.abort(manager);
                }
                pool.release(id.index, 1);
                return Err(err);
            }
        };

        let target = pushbuffer.target(!protected);
        let setup = pushbuffer.cpu_words(span, target).and_then(|words| {
            let info = PushInfo::new(description, location);
            let slot = pool.state.lock().rings[id.index].alloc_info(info)?;
            Ok((words, slot))
        });
        let (words, info_slot) = match setup {
            Ok(setup) => setup,
            Err(err) => {
                pushbuffer.abort_push(span);
                pool.release(id.index, 1);
                pushbuffer.release_gate();
                if let Some(launch) = launch {
                    launch.abort(manager);
                }
                return Err(err);
            }
        };

        let capacity = match target {
            PushTarget::Staged => words.len() - TRAILER_WORDS,
            _ => words.len(),
        };

        log::trace!("begin push '{}' on {}", description, pool.channels[id.index].name);
        Ok(Self {
            manager,
            id,
            span,
            target,
            words,
            cursor: 0,
            limit: (bytes as usize).div_ceil(4).min(capacity),
            capacity,
            info_slot,
            launch,
            on_complete: None,
            ended: false,
        })
    }

    fn pool(&self) -> &'a ChannelPool<D> {
        &self.manager.pools[self.id.pool]
    }

    /// Channel the push goes to
    pub fn channel(&self) -> ChannelRef<'a, D> {
        ChannelRef::new(self.manager, self.id)
    }

    /// Host method encoder of the device
    pub fn host(&self) -> &'a dyn HostHal {
        self.manager.shared.device.host_hal()
    }

    /// Copy engine method encoder of the device
    pub fn ce(&self) -> &'a dyn CeHal {
        self.manager.shared.device.ce_hal()
    }

    /// Security co-processor method encoder of the device
    pub fn sec2(&self) -> &'a dyn Sec2Hal {
        self.manager.shared.device.sec2_hal()
    }

    /// Bytes recorded so far
    pub fn len_bytes(&self) -> u32 {
        (self.cursor * 4) as u32
    }

    /// Bytes the caller may still record
    pub fn remaining_bytes(&self) -> u32 {
        ((self.limit - self.cursor) * 4) as u32
    }

    /// GPU address the engine fetches the push from
    pub fn gpu_va(&self) -> Result<GpuAddr> {
        self.manager.shared.pushbuffer.gpu_va(self.span, self.target)
    }

    /// Description given at begin
    pub fn description(&self) -> alloc::string::String {
        let state = self.pool().state.lock();
        state.rings[self.id.index]
            .info(self.info_slot)
            .map(|info| alloc::string::String::from(info.description.as_str()))
            .unwrap_or_default()
    }

    /// Embed data in the method stream and return its GPU address
    pub fn inline_data(&mut self, data: &[u32]) -> Result<GpuAddr> {
        let header = self.host().inline_header_words() as u64;
        let va = self.gpu_va()?.offset((self.cursor as u64 + header) * 4);
        let host = self.host();
        host.inline_data(&mut *self, data)?;
        Ok(va)
    }

    /// Run `callback` once the push has completed on the GPU
    ///
    /// Callbacks run from progress updates, outside of any channel lock.
    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(alloc::boxed::Box::new(callback));
    }

    /// Reserve the IV the channel's engine uses for its next encryption
    pub fn log_device_encryption(&self) -> Result<CslIv> {
        let channel = &self.pool().channels[self.id.index];
        let csl = channel.csl.as_deref().ok_or(Error::NotSupported)?;
        Ok(csl.log_device_encryption())
    }

    /// Close and submit the push; returns its tracking value
    pub fn end(mut self) -> Result<u64> {
        self.finish()
    }

    /// End the push and wait for it to complete
    pub fn end_and_wait(self) -> Result<u64> {
        let manager = self.manager;
        let id = self.id;
        let value = self.end()?;
        manager.pools[id.pool].wait_for(&manager.shared, id.index, value)?;
        Ok(value)
    }

    /// Give everything back without submitting
    pub(crate) fn abort(mut self) {
        self.ended = true;
        let manager = self.manager;
        let pool = self.pool();
        let pushbuffer = &manager.shared.pushbuffer;
        {
            let mut state = pool.state.lock();
            let ring = &mut state.rings[self.id.index];
            ring.free_info(self.info_slot);
            if !pool.pool_type.is_launch_pair() {
                ring.unclaim(1);
            }
            ChannelPool::<D>::unlock(&mut state, self.id.index);
        }
        pushbuffer.abort_push(self.span);
        pool.release_gate();
        pushbuffer.release_gate();
        if let Some(launch) = self.launch.take() {
            launch.abort(manager);
        }
    }

    fn finish(&mut self) -> Result<u64> {
        self.ended = true;
        self.limit = self.capacity;
        let pool = self.pool();
        let launch = self.launch.take();

        let result = {
            let mut state = pool.state.lock();
            let result = self.submit(&mut state, launch);
            ChannelPool::<D>::unlock(&mut state, self.id.index);
            result
        };
        pool.release_gate();
        self.manager.shared.pushbuffer.release_gate();
        result
    }

    /// Append the tracking release, commit the entry and hand it to the
    /// GPU; runs under the pool lock
    fn submit(&mut self, state: &mut PoolState, launch: Option<Launch<'a, D>>) -> Result<u64> {
        let manager = self.manager;
        let shared = &manager.shared;
        let device = &shared.device;
        let pushbuffer = &shared.pushbuffer;
        let pool = self.pool();
        let index = self.id.index;
        let channel = &pool.channels[index];

        let value = channel.tracking.queued() + 1;
        let released = match pool.pool_type {
            PoolType::Sec2 => {
                device
                    .sec2_hal()
                    .semaphore_release(&mut *self, channel.tracking.gpu_va(), value as u32)
            }
            _ => channel.tracking.emit_release(&mut *self, device.ce_hal(), value),
        };
        let gpu_va = released.and_then(|_| pushbuffer.gpu_va(self.span, self.target));
        let gpu_va = match gpu_va {
            Ok(va) => va,
            Err(err) => {
                let ring = &mut state.rings[index];
                ring.free_info(self.info_slot);
                if !pool.pool_type.is_launch_pair() {
                    ring.unclaim(1);
                }
                pushbuffer.abort_push(self.span);
                if let Some(launch) = launch {
                    launch.abort(manager);
                }
                return Err(err);
            }
        };

        // From here on the entry exists and failures are fatal
        channel.tracking.advance_queued();
        if channel.tracking.is_secure() {
            if let Some(csl) = channel.tracking_csl.as_deref() {
                channel.tracking.record_release_iv(value, csl.log_device_encryption());
            }
        }

        let bytes = self.len_bytes();
        let staged = match self.target {
            PushTarget::Staged => TRAILER_WORDS as u64 * 4,
            _ => 0,
        };
        let ring = &mut state.rings[index];
        if let Some(callback) = self.on_complete.take() {
            if let Some(info) = ring.info_mut(self.info_slot) {
                info.on_complete = Some(callback);
            }
        }
        let token = pushbuffer.end_push(self.span, bytes as u64 + staged);
        let slot = ring.commit(GpfifoEntry::Push {
            token,
            gpu_va,
            bytes,
            tracking_value: value,
            info: self.info_slot,
        })?;
        let handoff = Handoff {
            old_put: slot.raw(),
            new_put: ring.put().raw(),
            entry: device.host_hal().gpfifo_entry(gpu_va, bytes),
            bytes,
        };

        fence(Ordering::SeqCst);
        let launched = launch.is_some();
        let published = match launch {
            Some(launch) => manager.launch_indirect(self, launch, &handoff),
            None if pool.flags.contains(PoolFlags::PROXY) => {
                let words: Vec<u32> = self.words[..self.cursor]
                    .iter()
                    .map(|w| w.load(Ordering::Relaxed))
                    .collect();
                channel.queue.push_stream(&words)
            }
            None => channel
                .queue
                .write_gpfifo_entry(handoff.old_put, handoff.entry)
                .and_then(|_| {
                    fence(Ordering::Release);
                    channel.queue.write_gpu_put(handoff.new_put)
                })
                .map(|_| channel.queue.ring_doorbell()),
        };

        if let Err(err) = published {
            let err = match err {
                err if err.is_fatal() => err,
                _ if launched => Error::IndirectLaunchFailed,
                _ => Error::ChannelError,
            };
            return Err(pool.escalate(shared, index, err));
        }

        log::trace!("{}: submitted push {} ({} bytes)", channel.name, value, bytes);
        Ok(value)
    }
}

impl<D: Device> MethodSink for Push<'_, D> {
    fn emit(&mut self, words: &[u32]) -> Result<()> {
        let end = self.cursor + words.len();
        if end > self.limit {
            return Err(Error::PushBufferOverflow);
        }
        for (slot, word) in self.words[self.cursor..end].iter().zip(words) {
            slot.store(*word, Ordering::Relaxed);
        }
        self.cursor = end;
        Ok(())
    }
}

impl<D: Device> Drop for Push<'_, D> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        log::warn!(
            "push on {} dropped without end, submitting it",
            self.pool().channels[self.id.index].name
        );
        if let Err(err) = self.finish() {
            log::error!("ending dropped push failed: {}", err);
        }
    }
}

impl<D: Device> core::fmt::Debug for Push<'_, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Push")
            .field("channel", &self.pool().channels[self.id.index].name.as_str())
            .field("span", &self.span)
            .field("target", &self.target)
            .field("words", &self.cursor)
            .finish()
    }
}
