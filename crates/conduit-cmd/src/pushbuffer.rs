//! # Pushbuffer
//!
//! Backing memory for push command words, split into chunks that each
//! behave as a small ring of pending pushes.
//!
//! ```text
//!   chunk (wrapped)                      chunk (not wrapped)
//!   ┌──────┬───────────┬───────────┐     ┌───────┬───────────┬──────┐
//!   │ busy │   free    │   busy    │     │ free  │   busy    │ free │
//!   └──────┴───────────┴───────────┘     └───────┴───────────┴──────┘
//!          ^put        ^head.start               ^head.start ^put
//! ```
//!
//! A counting gate sized to the chunk count bounds concurrent pushes: a
//! push holds exactly one chunk from begin until end. The gate unit is
//! returned by the owner once its channel lock has been dropped.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use conduit_core::{BufferLocation, ByteSize, CountingGate, Error, GpuAddr, Result};
use conduit_hal::{AllocDesc, Device, DeviceMemory};

use crate::config::{ChannelManagerConfig, PUSH_SLOT_SIZE};
use crate::context::Context;

// =============================================================================
// HANDLES
// =============================================================================

/// Space handed to a push between begin and end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSpan {
    chunk: u32,
    /// Byte offset within the chunk
    offset: u64,
}

impl PushSpan {
    /// Chunk the push lives in
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Byte offset within the chunk
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Handle to an ended push, used to retire it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PbToken {
    chunk: u32,
    seq: u64,
}

/// Which copy of the pushbuffer a push is written to and fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushTarget {
    /// CPU writes and GPU fetches the primary copy
    Direct,
    /// CPU writes and GPU fetches the unprotected mirror
    Mirror,
    /// CPU writes scratch; the ciphertext goes to the mirror and the GPU
    /// decrypts it into the protected primary copy
    Staged,
}

// =============================================================================
// CHUNK STATE
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PendingPush {
    seq: u64,
    start: u64,
    end: u64,
}

#[derive(Debug, Default)]
struct Chunk {
    next_push_start: u64,
    pending: VecDeque<PendingPush>,
    /// A push is being written
    current: bool,
}

#[derive(Debug)]
struct PbState {
    chunks: Vec<Chunk>,
    /// Chunks with nothing pending
    idle: u64,
    /// Chunks with room for a full push slot
    available: u64,
    next_seq: u64,
}

/// Pushbuffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushbufferStats {
    /// Pushes begun
    pub pushes_started: u64,
    /// Pushes retired
    pub pushes_completed: u64,
}

// =============================================================================
// PUSHBUFFER
// =============================================================================

/// Chunked pushbuffer allocator
pub struct Pushbuffer<M> {
    primary: M,
    mirror: Option<M>,
    scratch: Option<Box<[AtomicU32]>>,
    chunk_size: u64,
    num_chunks: u32,
    gate: CountingGate,
    state: spin::Mutex<PbState>,
    started: AtomicU64,
    completed: AtomicU64,
}

impl<M> core::fmt::Debug for Pushbuffer<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pushbuffer")
            .field("chunk_size", &self.chunk_size)
            .field("num_chunks", &self.num_chunks)
            .field("secure", &self.mirror.is_some())
            .finish()
    }
}

impl<M: DeviceMemory> Pushbuffer<M> {
    /// Allocate the pushbuffer
    ///
    /// In secure mode the primary copy is protected video memory and the
    /// CPU stages pushes in scratch memory.
    pub fn new<D>(device: &D, config: &ChannelManagerConfig, secure: bool) -> Result<Self>
    where
        D: Device<Memory = M>,
    {
        let chunk_size = config.chunk_size.as_bytes();
        let num_chunks = config.pushbuffer_chunks;
        let size = ByteSize::from_bytes(chunk_size * num_chunks as u64);

        let (primary, mirror, scratch) = if secure {
            let primary = device
                .alloc_memory(&AllocDesc::new("pushbuffer", size, BufferLocation::Vid).protected())?;
            let mirror = device.alloc_memory(&AllocDesc::new(
                "pushbuffer mirror",
                size,
                BufferLocation::Sys,
            ))?;
            let scratch: Box<[AtomicU32]> =
                (0..size.as_words()).map(|_| AtomicU32::new(0)).collect();
            (primary, Some(mirror), Some(scratch))
        } else {
            let primary =
                device.alloc_memory(&AllocDesc::new("pushbuffer", size, config.pushbuffer_location))?;
            (primary, None, None)
        };

        let all = if num_chunks == 64 { u64::MAX } else { (1u64 << num_chunks) - 1 };
        let chunks = (0..num_chunks).map(|_| Chunk::default()).collect();

        log::debug!(
            "pushbuffer: {} chunks of {} at {}{}",
            num_chunks,
            config.chunk_size,
            primary.gpu_va(),
            if secure { " (protected)" } else { "" }
        );

        Ok(Self {
            primary,
            mirror,
            scratch,
            chunk_size,
            num_chunks,
            gate: CountingGate::new(num_chunks),
            state: spin::Mutex::new(PbState {
                chunks,
                idle: all,
                available: all,
                next_seq: 0,
            }),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        })
    }

    /// Bytes per chunk
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks
    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// Whether pushes are staged and encrypted
    pub fn is_secure(&self) -> bool {
        self.mirror.is_some()
    }

    /// Get pushbuffer statistics
    pub fn stats(&self) -> PushbufferStats {
        PushbufferStats {
            pushes_started: self.started.load(Ordering::Relaxed),
            pushes_completed: self.completed.load(Ordering::Relaxed),
        }
    }

    /// Claim space for one push
    ///
    /// Prefers an idle chunk, then the first chunk with room. While nothing
    /// fits `progress` is called to retire completed work.
    pub fn begin_push(
        &self,
        ctx: &Context,
        progress: &mut dyn FnMut() -> Result<()>,
    ) -> Result<PushSpan> {
        let mut spin = ctx.spin_loop("pushbuffer space");
        while !self.gate.try_acquire() {
            progress()?;
            ctx.status()?;
            spin.spin()?;
        }

        loop {
            if let Some(span) = self.try_claim() {
                self.started.fetch_add(1, Ordering::Relaxed);
                return Ok(span);
            }
            let waited = progress().and_then(|_| ctx.status()).and_then(|_| spin.spin());
            if let Err(err) = waited {
                self.gate.release();
                return Err(err);
            }
        }
    }

    fn try_claim(&self) -> Option<PushSpan> {
        let mut state = self.state.lock();
        let candidates = match state.idle & state.available {
            0 => state.available,
            idle => idle,
        };
        if candidates == 0 {
            return None;
        }

        let chunk = candidates.trailing_zeros();
        let bit = 1u64 << chunk;
        state.idle &= !bit;
        state.available &= !bit;
        let entry = &mut state.chunks[chunk as usize];
        entry.current = true;
        Some(PushSpan {
            chunk,
            offset: entry.next_push_start,
        })
    }

    /// Record the end of a push of `bytes` bytes
    ///
    /// Called under the owning channel's lock; the gate unit is returned
    /// separately through [`Pushbuffer::release_gate`].
    pub fn end_push(&self, span: PushSpan, bytes: u64) -> PbToken {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let chunk = &mut state.chunks[span.chunk as usize];
        let end = span.offset + bytes.next_multiple_of(4);
        chunk.pending.push_back(PendingPush {
            seq,
            start: span.offset,
            end,
        });
        chunk.next_push_start = end;
        chunk.current = false;
        self.update_chunk(&mut state, span.chunk);

        PbToken {
            chunk: span.chunk,
            seq,
        }
    }

    /// Give back a span that never became a push
    ///
    /// The gate unit stays with the caller.
    pub fn abort_push(&self, span: PushSpan) {
        let mut state = self.state.lock();
        state.chunks[span.chunk as usize].current = false;
        self.update_chunk(&mut state, span.chunk);
    }

    /// Return the concurrency unit taken at begin
    pub fn release_gate(&self) {
        self.gate.release();
    }

    /// Retire an ended push
    pub fn mark_completed(&self, token: PbToken) {
        let mut state = self.state.lock();
        let chunk = &mut state.chunks[token.chunk as usize];
        let Some(pos) = chunk.pending.iter().position(|p| p.seq == token.seq) else {
            log::warn!("pushbuffer: retiring unknown push {}", token.seq);
            return;
        };
        let at_edge = pos == 0 || pos + 1 == chunk.pending.len();
        chunk.pending.remove(pos);
        let current = chunk.current;
        self.completed.fetch_add(1, Ordering::Relaxed);

        // Space only changes when the oldest or newest push goes away
        if at_edge && !current {
            self.update_chunk(&mut state, token.chunk);
        }
    }

    fn update_chunk(&self, state: &mut PbState, index: u32) {
        let bit = 1u64 << index;
        let chunk_size = self.chunk_size;
        let chunk = &mut state.chunks[index as usize];
        if chunk.current {
            state.idle &= !bit;
            state.available &= !bit;
            return;
        }

        let space = match chunk.pending.front() {
            None => {
                chunk.next_push_start = 0;
                state.idle |= bit;
                state.available |= bit;
                return;
            }
            Some(head) if chunk.next_push_start <= head.start => {
                head.start - chunk.next_push_start
            }
            Some(head) => {
                let after = chunk_size - chunk.next_push_start;
                if head.start > after {
                    chunk.next_push_start = 0;
                    head.start
                } else {
                    after
                }
            }
        };

        state.idle &= !bit;
        if space >= PUSH_SLOT_SIZE.as_bytes() {
            state.available |= bit;
        } else {
            state.available &= !bit;
        }
    }

    // =========================================================================
    // Views
    // =========================================================================

    fn word_range(&self, span: PushSpan) -> Range<usize> {
        let start = span.chunk as u64 * self.chunk_size + span.offset;
        (start / 4) as usize..((start + PUSH_SLOT_SIZE.as_bytes()) / 4) as usize
    }

    fn byte_offset(&self, span: PushSpan) -> u64 {
        span.chunk as u64 * self.chunk_size + span.offset
    }

    /// Words the CPU writes the push into
    pub fn cpu_words(&self, span: PushSpan, target: PushTarget) -> Result<&[AtomicU32]> {
        let words = match target {
            PushTarget::Direct => self.primary.cpu_words(),
            PushTarget::Mirror => self.mirror.as_ref().and_then(|m| m.cpu_words()),
            PushTarget::Staged => self.scratch.as_deref(),
        }
        .ok_or(Error::AccessDenied)?;
        words.get(self.word_range(span)).ok_or(Error::InvalidParameter)
    }

    /// Address the GPU fetches the push from
    pub fn gpu_va(&self, span: PushSpan, target: PushTarget) -> Result<GpuAddr> {
        let base = match target {
            PushTarget::Direct | PushTarget::Staged => self.primary.gpu_va(),
            PushTarget::Mirror => self.mirror.as_ref().ok_or(Error::NotSupported)?.gpu_va(),
        };
        Ok(base.offset(self.byte_offset(span)))
    }

    /// Unprotected words the ciphertext of a staged push goes to
    pub fn mirror_words(&self, span: PushSpan) -> Result<&[AtomicU32]> {
        self.cpu_words(span, PushTarget::Mirror)
    }

    /// GPU address of the ciphertext of a staged push
    pub fn mirror_va(&self, span: PushSpan) -> Result<GpuAddr> {
        self.gpu_va(span, PushTarget::Mirror)
    }

    /// Default target for pushes on this pushbuffer
    pub fn target(&self, cpu_visible_channel: bool) -> PushTarget {
        match (self.is_secure(), cpu_visible_channel) {
            (false, _) => PushTarget::Direct,
            (true, true) => PushTarget::Mirror,
            (true, false) => PushTarget::Staged,
        }
    }

    #[cfg(test)]
    fn masks(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.idle, state.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::SpinConfig;
    use conduit_hal::sim::{SimConfig, SimDevice, SimMemory};

    fn pushbuffer(chunks: u32, chunk_size: ByteSize) -> (SimDevice, Pushbuffer<SimMemory>) {
        let device = SimDevice::new(SimConfig::new(0));
        let mut config = ChannelManagerConfig::default().with_pushbuffer(chunks, chunk_size);
        config.normalize(true, false);
        let pb = Pushbuffer::new(&device, &config, false).unwrap();
        (device, pb)
    }

    fn bounded() -> Context {
        Context::new(SpinConfig {
            max_spins: Some(1000),
            ..SpinConfig::default()
        })
    }

    #[test]
    fn test_prefers_idle_chunk() {
        let (_device, pb) = pushbuffer(4, ByteSize::from_mib(1));
        let ctx = bounded();
        let a = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        let token = pb.end_push(a, 64);
        pb.release_gate();
        assert_eq!(pb.masks(), (0b1110, 0b1111));

        // Chunk 0 still has room but chunk 1 is idle
        let b = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_eq!(b.chunk(), 1);
        pb.abort_push(b);
        pb.release_gate();

        pb.mark_completed(token);
        assert_eq!(pb.masks(), (0b1111, 0b1111));
        assert_eq!(pb.stats().pushes_completed, 1);
    }

    #[test]
    fn test_full_slot_chunk() {
        let (_device, pb) = pushbuffer(1, PUSH_SLOT_SIZE);
        let ctx = bounded();
        let span = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_eq!(pb.cpu_words(span, PushTarget::Direct).unwrap().len(), PUSH_SLOT_SIZE.as_words());
        let token = pb.end_push(span, PUSH_SLOT_SIZE.as_bytes());
        pb.release_gate();
        assert_eq!(pb.masks(), (0, 0));

        let mut polls = 0;
        let result = pb.begin_push(&ctx, &mut || {
            polls += 1;
            Ok(())
        });
        assert_eq!(result, Err(Error::Timeout));
        assert!(polls > 0);

        pb.mark_completed(token);
        let span = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_eq!(span.offset(), 0);
        pb.abort_push(span);
        pb.release_gate();
    }

    #[test]
    fn test_chunk_wraps() {
        let slot = PUSH_SLOT_SIZE.as_bytes();
        let (_device, pb) = pushbuffer(1, ByteSize::from_bytes(slot * 3));
        let ctx = bounded();

        let mut tokens = Vec::new();
        for expected in [0, slot, slot * 2] {
            let span = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
            assert_eq!(span.offset(), expected);
            tokens.push(pb.end_push(span, slot));
            pb.release_gate();
        }
        assert_eq!(pb.masks(), (0, 0));

        // Retiring the middle push frees nothing usable
        pb.mark_completed(tokens[1]);
        assert_eq!(pb.masks(), (0, 0));

        // Retiring the head opens the front of the chunk
        pb.mark_completed(tokens[0]);
        assert_eq!(pb.masks(), (0, 1));
        let span = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_eq!(span.offset(), 0);
        let token = pb.end_push(span, 256);
        pb.release_gate();

        // Wrapped: free space runs from 256 up to the last push
        assert_eq!(pb.masks(), (0, 1));
        pb.mark_completed(tokens[2]);
        pb.mark_completed(token);
        assert_eq!(pb.masks(), (1, 1));
    }

    #[test]
    fn test_gate_bounds_concurrent_pushes() {
        let (_device, pb) = pushbuffer(2, ByteSize::from_mib(1));
        let ctx = bounded();
        let a = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        let b = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_ne!(a.chunk(), b.chunk());
        assert_eq!(pb.begin_push(&ctx, &mut || Ok(())), Err(Error::Timeout));
        pb.abort_push(a);
        pb.release_gate();
        let c = pb.begin_push(&ctx, &mut || Ok(())).unwrap();
        assert_eq!(c.chunk(), a.chunk());
        pb.abort_push(b);
        pb.release_gate();
        pb.abort_push(c);
        pb.release_gate();
    }

    #[test]
    fn test_secure_views() {
        let device = SimDevice::new(SimConfig::confidential(0));
        let mut config =
            ChannelManagerConfig::default().with_pushbuffer(2, PUSH_SLOT_SIZE);
        config.normalize(true, true);
        let pb = Pushbuffer::new(&device, &config, true).unwrap();
        let ctx = bounded();
        let span = pb.begin_push(&ctx, &mut || Ok(())).unwrap();

        assert_eq!(pb.target(false), PushTarget::Staged);
        assert!(pb.cpu_words(span, PushTarget::Direct).is_err());
        assert!(pb.cpu_words(span, PushTarget::Staged).is_ok());
        assert!(pb.mirror_words(span).is_ok());
        let primary = pb.gpu_va(span, PushTarget::Staged).unwrap();
        assert!(device.is_protected(primary).unwrap());
        assert!(!device.is_protected(pb.mirror_va(span).unwrap()).unwrap());
        pb.abort_push(span);
        pb.release_gate();
    }
}
