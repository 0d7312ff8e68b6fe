//! Indirect launch of pushes on protected channels.
//!
//! The WLC channel runs a fixed schedule uploaded once at bring-up:
//!
//! ```text
//!   WLC GPFIFO    even slots -> block A    odd slots -> block B
//!   LCIC GPFIFO   every slot -> block L
//!
//!   A: decrypt staged record into launch buffer, call launch buffer
//!   B: LCIC put += 1, ring LCIC
//!   L: WLC put += 2, WLC tracking += 1 (encrypted publish)
//! ```
//!
//! A launch record decrypts the push into the protected pushbuffer, waits
//! for the target GPPUT to hold the expected value, writes the GPFIFO entry
//! and the new GPPUT, and rings the target.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::Location;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use conduit_core::{BufferLocation, ByteSize, Error, GpuAddr, Result};
use conduit_hal::{
    AcquireMode, AllocDesc, CryptoTrailer, CslContext, Device, DeviceMemory, HostHal,
    HwQueue, MethodSink, QueueInfo, WordBuffer, TRAILER_WORDS,
};

use crate::channel::Channel;
use crate::config::MAX_PUSH_SIZE;
use crate::manager::ChannelManager;
use crate::pool::ChannelPool;
use crate::push::Push;

/// Words in a launch record
pub const RECORD_WORDS: usize = 64;

/// Words in the WLC/LCIC schedule image
pub const SCHEDULE_WORDS: usize = 128;

const RECORD_BYTES: u32 = (RECORD_WORDS * 4) as u32;
const BLOCK_WORDS: usize = 32;
const BLOCK_A: usize = 0;
const BLOCK_B: usize = BLOCK_WORDS;
const BLOCK_L: usize = 2 * BLOCK_WORDS;

// =============================================================================
// LAUNCH SLOTS
// =============================================================================

/// Memory owned by one WLC channel
#[derive(Debug)]
pub(crate) struct LaunchSlots<M> {
    /// Protected copy of the schedule image
    schedule: M,
    /// Protected buffer the decrypted record is called from
    launch_buf: M,
    /// Unprotected record ciphertext and trailer
    staging: M,
}

impl<M: DeviceMemory> LaunchSlots<M> {
    pub(crate) fn new<D: Device<Memory = M>>(device: &D) -> Result<Self> {
        let schedule = device.alloc_memory(
            &AllocDesc::new(
                "launch schedule",
                ByteSize::from_bytes(SCHEDULE_WORDS as u64 * 4),
                BufferLocation::Vid,
            )
            .protected(),
        )?;
        let launch_buf = device.alloc_memory(
            &AllocDesc::new(
                "launch record",
                ByteSize::from_bytes(RECORD_BYTES as u64),
                BufferLocation::Vid,
            )
            .protected(),
        )?;
        let staging = device.alloc_memory(&AllocDesc::new(
            "launch staging",
            ByteSize::from_bytes(((RECORD_WORDS + TRAILER_WORDS) * 4) as u64),
            BufferLocation::Sys,
        ))?;
        Ok(Self {
            schedule,
            launch_buf,
            staging,
        })
    }

    fn block_va(&self, word: usize) -> GpuAddr {
        self.schedule.gpu_va().offset(word as u64 * 4)
    }

    fn staging_trailer_va(&self) -> GpuAddr {
        self.staging.gpu_va().offset(RECORD_BYTES as u64)
    }

    /// Copy a record ciphertext and its trailer into staging
    fn stage(&self, record: &[u32], trailer: &CryptoTrailer) -> Result<()> {
        for (i, word) in record.iter().chain(trailer.as_words()).enumerate() {
            self.staging.write_u32(i * 4, *word)?;
        }
        Ok(())
    }
}

/// The channel that will launch a protected push
pub(crate) enum Launch<'a, D: Device> {
    /// SEC2 push under construction
    Sec2(Box<Push<'a, D>>),
    /// Reserved WLC channel
    Wlc(usize),
}

impl<'a, D: Device> Launch<'a, D> {
    /// Give the launch channel back without launching anything
    pub(crate) fn abort(self, manager: &'a ChannelManager<D>) {
        match self {
            Launch::Sec2(push) => (*push).abort(),
            Launch::Wlc(index) => {
                if let Some(pool) = manager.wlc_pool() {
                    pool.release(index, 1);
                }
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Store words into a CPU mapping
fn store_words(dst: &[AtomicU32], at: usize, words: &[u32]) -> Result<()> {
    let slots = dst.get(at..at + words.len()).ok_or(Error::PushBufferOverflow)?;
    for (slot, word) in slots.iter().zip(words) {
        slot.store(*word, Ordering::Relaxed);
    }
    Ok(())
}

/// Wait for the target's GPPUT, write its GPFIFO entry and GPPUT, ring it
fn emit_handoff(
    sink: &mut dyn MethodSink,
    host: &dyn HostHal,
    release: &dyn Fn(&mut dyn MethodSink, GpuAddr, u32) -> Result<()>,
    target: &QueueInfo,
    old_put: u32,
    new_put: u32,
    entry: u64,
) -> Result<()> {
    host.semaphore_acquire(sink, target.gpput_gpu_va, old_put, AcquireMode::Eq)?;
    let entry_va = target.gpfifo_entry_va(old_put);
    release(sink, entry_va, entry as u32)?;
    release(sink, entry_va.offset(4), (entry >> 32) as u32)?;
    release(sink, target.gpput_gpu_va, new_put)?;
    host.doorbell(sink, target.work_submission_token)
}

/// Where an ended push has to go
pub(crate) struct Handoff {
    pub old_put: u32,
    pub new_put: u32,
    pub entry: u64,
    pub bytes: u32,
}

impl<D: Device> ChannelManager<D> {
    // =========================================================================
    // Launch
    // =========================================================================

    /// Reserve the channel that will launch a protected push
    ///
    /// Before the launch schedule is up this is a SEC2 push; afterwards an
    /// idle WLC channel.
    #[track_caller]
    pub(crate) fn begin_launch(&self) -> Result<Launch<'_, D>> {
        if !self.is_secure_launch_ready() {
            let pool = self.sec2_index.ok_or(Error::SecureLaunchNotReady)?;
            let location = Location::caller();
            let id = self.reserve_in_pool(pool, 1)?;
            let push = Push::begin(self, id, MAX_PUSH_SIZE.as_bytes() as u32, "indirect launch", location)?;
            return Ok(Launch::Sec2(Box::new(push)));
        }

        let pool_index = self.wlc_index.ok_or(Error::SecureLaunchNotReady)?;
        let id = self.reserve_in_pool(pool_index, 1)?;
        let pool = &self.pools[pool_index];
        let channel = &pool.channels[id.index];

        // The staging slot is reused, so the previous launch must be done
        let idle = self.shared.ctx.wait_until("launch channel idle", || {
            pool.update_progress(&self.shared, id.index, false)?;
            if channel.is_idle() {
                return Ok(true);
            }
            pool.check_errors(&self.shared, id.index)?;
            Ok(false)
        });
        if let Err(err) = idle {
            pool.release(id.index, 1);
            return Err(err);
        }
        Ok(Launch::Wlc(id.index))
    }

    /// Launch an ended push whose GPFIFO the CPU cannot write
    ///
    /// Called with the target pool lock held.
    pub(crate) fn launch_indirect(
        &self,
        push: &Push<'_, D>,
        launch: Launch<'_, D>,
        handoff: &Handoff,
    ) -> Result<()> {
        let pool = &self.pools[push.id.pool];
        let target = &pool.channels[push.id.index];
        let mut plain: Vec<u32> = push.words[..push.cursor]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();

        match launch {
            Launch::Wlc(index) => {
                let result = self.launch_wlc(pool, target, push, &mut plain, index, handoff);
                if let Some(wlc) = self.wlc_pool() {
                    wlc.release(index, 1);
                }
                result
            }
            Launch::Sec2(mut sec2) => {
                match self.stage_sec2(pool, target, push, &mut plain, &mut sec2, handoff) {
                    Ok(()) => (*sec2).end().map(drop),
                    Err(err) => {
                        (*sec2).abort();
                        Err(err)
                    }
                }
            }
        }
    }

    /// Encrypt the push for `csl` and place ciphertext plus trailer in the
    /// pushbuffer mirror
    fn seal_push(&self, push: &Push<'_, D>, csl: &D::Csl, plain: &mut [u32]) -> Result<()> {
        let trailer = csl.encrypt(plain)?;
        let mirror = self.shared.pushbuffer.mirror_words(push.span)?;
        store_words(mirror, 0, plain)?;
        store_words(mirror, plain.len(), trailer.as_words())
    }

    fn stage_sec2(
        &self,
        pool: &ChannelPool<D>,
        target: &Channel<D>,
        push: &Push<'_, D>,
        plain: &mut [u32],
        sec2: &mut Push<'_, D>,
        handoff: &Handoff,
    ) -> Result<()> {
        let launcher = sec2.channel().channel();
        let csl = launcher.csl.as_deref().ok_or(Error::IndirectLaunchFailed)?;
        self.seal_push(push, csl, plain)?;
        pool.stats.add_encrypted(handoff.bytes as u64);

        let pb = &self.shared.pushbuffer;
        let device = &self.shared.device;
        let sec2_hal = device.sec2_hal();
        let mirror_va = pb.mirror_va(push.span)?;
        sec2_hal.decrypt(
            &mut *sec2,
            pb.gpu_va(push.span, push.target)?,
            mirror_va,
            handoff.bytes,
            mirror_va.offset(handoff.bytes as u64),
        )?;
        emit_handoff(
            &mut *sec2,
            device.host_hal(),
            &|sink, va, value| sec2_hal.semaphore_release(sink, va, value),
            target.queue_info(),
            handoff.old_put,
            handoff.new_put,
            handoff.entry,
        )
    }

    fn launch_wlc(
        &self,
        pool: &ChannelPool<D>,
        target: &Channel<D>,
        push: &Push<'_, D>,
        plain: &mut [u32],
        index: usize,
        handoff: &Handoff,
    ) -> Result<()> {
        let wlc = self.wlc_pool().ok_or(Error::SecureLaunchNotReady)?;
        let lcic = self.lcic_pool().ok_or(Error::SecureLaunchNotReady)?;
        let w = &wlc.channels[index];
        let l = &lcic.channels[index];
        let slots = w.launch.as_ref().ok_or(Error::SecureLaunchNotReady)?;
        let w_csl = w.csl.as_deref().ok_or(Error::IndirectLaunchFailed)?;
        let l_csl = l.csl.as_deref().ok_or(Error::IndirectLaunchFailed)?;

        let pb = &self.shared.pushbuffer;
        let device = &self.shared.device;
        let ce = device.ce_hal();
        let host = device.host_hal();
        let mirror_va = pb.mirror_va(push.span)?;

        let mut record = WordBuffer::with_limit(RECORD_WORDS);
        ce.decrypt(
            &mut record,
            pb.gpu_va(push.span, push.target)?,
            mirror_va,
            handoff.bytes,
            mirror_va.offset(handoff.bytes as u64),
        )?;
        emit_handoff(
            &mut record,
            host,
            &|sink, va, value| ce.semaphore_release(sink, va, value),
            target.queue_info(),
            handoff.old_put,
            handoff.new_put,
            handoff.entry,
        )?;
        let padding = (RECORD_WORDS - record.len()) as u32;
        host.noop(&mut record, padding)?;
        let mut record = record.into_words();

        // The schedule decrypts the record before the record decrypts the push
        let record_trailer = w_csl.encrypt(&mut record)?;
        self.seal_push(push, w_csl, plain)?;
        slots.stage(&record, &record_trailer)?;
        pool.stats.add_encrypted(handoff.bytes as u64);
        wlc.stats.add_encrypted(RECORD_BYTES as u64);

        {
            let _guard = wlc.state.lock();
            let value = w.tracking.advance_queued();
            w.tracking.record_release_iv(value, l_csl.log_device_encryption());
        }

        fence(Ordering::SeqCst);
        w.queue.ring_doorbell();
        Ok(())
    }

    // =========================================================================
    // Bring-up
    // =========================================================================

    /// Upload the WLC/LCIC schedules and switch launches over to them
    pub(crate) fn setup_launch_pairs(&self) -> Result<()> {
        let (Some(wlc), Some(lcic)) = (self.wlc_pool(), self.lcic_pool()) else {
            return Ok(());
        };

        for index in 0..wlc.channels.len() {
            self.setup_launch_pair(wlc, lcic, index)?;
        }

        self.wlc_ready.store(true, Ordering::Release);
        log::info!(
            "secure launch ready on {} with {} channel pairs",
            self.shared.device.name(),
            wlc.channels.len()
        );
        Ok(())
    }

    fn setup_launch_pair(
        &self,
        wlc: &ChannelPool<D>,
        lcic: &ChannelPool<D>,
        index: usize,
    ) -> Result<()> {
        let w = &wlc.channels[index];
        let l = &lcic.channels[index];
        let slots = w.launch.as_ref().ok_or(Error::InvalidState)?;
        let w_info = *w.queue_info();
        let l_info = *l.queue_info();

        // Every slot is owned by the schedule from now on
        wlc.state.lock().rings[index].claim_all();
        lcic.state.lock().rings[index].claim_all();

        let device = &self.shared.device;
        let ce = device.ce_hal();
        let host = device.host_hal();

        let mut image = alloc::vec![0u32; SCHEDULE_WORDS];
        let mut block = WordBuffer::with_limit(BLOCK_WORDS);
        ce.decrypt(
            &mut block,
            slots.launch_buf.gpu_va(),
            slots.staging.gpu_va(),
            RECORD_BYTES,
            slots.staging_trailer_va(),
        )?;
        host.call(&mut block, slots.launch_buf.gpu_va(), RECORD_BYTES)?;
        let a_bytes = (block.len() * 4) as u32;
        image[BLOCK_A..BLOCK_A + block.len()].copy_from_slice(block.words());

        let mut block = WordBuffer::with_limit(BLOCK_WORDS);
        ce.semaphore_reduction_inc(&mut block, l_info.gpput_gpu_va, l_info.num_gpfifo_entries - 1)?;
        host.doorbell(&mut block, l_info.work_submission_token)?;
        let b_bytes = (block.len() * 4) as u32;
        image[BLOCK_B..BLOCK_B + block.len()].copy_from_slice(block.words());

        let mut block = WordBuffer::with_limit(SCHEDULE_WORDS - BLOCK_L);
        for _ in 0..2 {
            ce.semaphore_reduction_inc(&mut block, w_info.gpput_gpu_va, w_info.num_gpfifo_entries - 1)?;
        }
        w.tracking.emit_increment(&mut block, ce)?;
        let l_bytes = (block.len() * 4) as u32;
        image[BLOCK_L..BLOCK_L + block.len()].copy_from_slice(block.words());

        self.upload_schedule(slots, &image)?;

        let a_entry = host.gpfifo_entry(slots.block_va(BLOCK_A), a_bytes);
        let b_entry = host.gpfifo_entry(slots.block_va(BLOCK_B), b_bytes);
        let l_entry = host.gpfifo_entry(slots.block_va(BLOCK_L), l_bytes);

        let mut writes = Vec::new();
        for slot in 0..w_info.num_gpfifo_entries {
            let entry = if slot % 2 == 0 { a_entry } else { b_entry };
            writes.push((w_info.gpfifo_entry_va(slot), entry as u32));
            writes.push((w_info.gpfifo_entry_va(slot).offset(4), (entry >> 32) as u32));
        }
        for slot in 0..l_info.num_gpfifo_entries {
            writes.push((l_info.gpfifo_entry_va(slot), l_entry as u32));
            writes.push((l_info.gpfifo_entry_va(slot).offset(4), (l_entry >> 32) as u32));
        }
        // WLC is primed to run the first A/B pair on its first doorbell
        writes.push((w_info.gpput_gpu_va, 2));
        writes.push((l_info.gpput_gpu_va, 0));
        self.write_protected(&writes)?;

        log::debug!("launch schedule for {} / {} uploaded", w.name, l.name);
        Ok(())
    }

    /// Get the schedule image into protected memory through SEC2
    fn upload_schedule(&self, slots: &LaunchSlots<D::Memory>, image: &[u32]) -> Result<()> {
        let device = &self.shared.device;
        let bytes = (image.len() * 4) as u32;
        let upload = device.alloc_memory(&AllocDesc::new(
            "launch schedule upload",
            ByteSize::from_bytes(((image.len() + TRAILER_WORDS) * 4) as u64),
            BufferLocation::Sys,
        ))?;

        let sec2_pool = self.sec2_index.ok_or(Error::SecureLaunchNotReady)?;
        let mut reservation = self.reserve_pool(sec2_pool, 1)?;
        let mut push = reservation.begin_push("upload launch schedule")?;

        let csl = push.channel().channel().csl.clone().ok_or(Error::InvalidState)?;
        let mut cipher = image.to_vec();
        let trailer = csl.encrypt(&mut cipher)?;
        for (i, word) in cipher.iter().chain(trailer.as_words()).enumerate() {
            upload.write_u32(i * 4, *word)?;
        }
        self.pools[sec2_pool].stats.add_encrypted(bytes as u64);

        device.sec2_hal().decrypt(
            &mut push,
            slots.schedule.gpu_va(),
            upload.gpu_va(),
            bytes,
            upload.gpu_va().offset(bytes as u64),
        )?;
        push.end_and_wait()?;
        Ok(())
    }

    /// Write words into protected memory with SEC2 semaphore releases
    ///
    /// Splits into as many pushes as needed and waits for the last one.
    fn write_protected(&self, writes: &[(GpuAddr, u32)]) -> Result<()> {
        let sec2_pool = self.sec2_index.ok_or(Error::SecureLaunchNotReady)?;
        let sec2 = self.shared.device.sec2_hal();

        let mut pending = writes;
        while !pending.is_empty() {
            let mut reservation = self.reserve_pool(sec2_pool, 1)?;
            let mut push = reservation.begin_push("write launch schedule")?;
            let mut written = 0;
            for (va, value) in pending {
                let mut method = WordBuffer::with_limit(BLOCK_WORDS);
                sec2.semaphore_release(&mut method, *va, *value)?;
                match push.emit(method.words()) {
                    Ok(()) => written += 1,
                    Err(Error::PushBufferOverflow) if written > 0 => break,
                    Err(err) => return Err(err),
                }
            }
            pending = &pending[written..];
            push.end_and_wait()?;
        }
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Wait for the launch channels to go idle
    pub(crate) fn drain_launch_pairs(&self) -> Result<()> {
        let Some(wlc) = self.wlc_pool() else {
            return Ok(());
        };
        for index in 0..wlc.channels.len() {
            wlc.wait(&self.shared, index)?;
        }
        Ok(())
    }
}
