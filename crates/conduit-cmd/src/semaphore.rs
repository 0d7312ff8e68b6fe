//! # Tracking Semaphores
//!
//! A 64-bit completion counter built on a 32-bit GPU semaphore payload.
//!
//! Producers advance `queued` when they append a release; the GPU writes
//! the low 32 bits of each released value; the CPU folds those writes back
//! into a monotonic `completed` counter. The secure variant keeps its
//! payload in protected memory and publishes an encrypted copy through an
//! unprotected mirror:
//!
//! ```text
//!   mirror slot (16 words)
//!   ┌─────────┬──────────┬────────────────────────┬─────────┐
//!   │ payload │ notifier │ trailer (IV + auth tag)│ unused  │
//!   │ (cipher)│ odd=busy │        7 words         │         │
//!   └─────────┴──────────┴────────────────────────┴─────────┘
//! ```

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

use conduit_core::{
    AdmissionLock, BufferLocation, ByteSize, Error, GpuAddr, LockKind, Result, SpinConfig,
    SpinLoop,
};
use conduit_hal::{
    AllocDesc, CeHal, CryptoTrailer, CslContext, CslIv, Device, DeviceMemory, MethodSink,
    TRAILER_WORDS,
};

use crate::secure::CryptoStats;

// =============================================================================
// LAYOUT
// =============================================================================

/// Size of each page a semaphore pool grows by
pub const SEMAPHORE_PAGE_SIZE: ByteSize = ByteSize::from_kib(4);

/// Words in a mirror slot
pub const MIRROR_WORDS: u32 = 16;

const MIRROR_PAYLOAD: u32 = 0;
const MIRROR_NOTIFIER: u32 = 1;
const MIRROR_TRAILER: u32 = 2;

const_assert!(MIRROR_TRAILER as usize + TRAILER_WORDS <= MIRROR_WORDS as usize);

/// Largest jump accepted by a semaphore not owned by a channel
pub const DEFAULT_MAX_JUMP: u64 = 1 << 31;

const NOTIFIER_RETRY_LIMIT: u64 = 1 << 20;

// =============================================================================
// SEMAPHORE POOL
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaphorePoolStats {
    /// Total allocations
    pub allocs: u64,
    /// Total frees
    pub frees: u64,
    /// Pages backing the pool
    pub pages: u32,
}

#[derive(Debug)]
struct PoolPages<M> {
    pages: Vec<Arc<M>>,
    /// Free (page, slot) pairs (stack for O(1) alloc/free)
    free_stack: Vec<(u32, u32)>,
    stats: SemaphorePoolStats,
}

/// Fixed-size slots carved out of device pages
#[derive(Debug)]
pub struct SemaphorePool<M> {
    name: &'static str,
    slot_words: u32,
    location: BufferLocation,
    protected: bool,
    state: spin::Mutex<PoolPages<M>>,
}

impl<M: DeviceMemory> SemaphorePool<M> {
    /// Create an empty pool of `slot_words`-word slots
    pub fn new(
        name: &'static str,
        slot_words: u32,
        location: BufferLocation,
        protected: bool,
    ) -> Self {
        Self {
            name,
            slot_words: slot_words.max(1),
            location,
            protected,
            state: spin::Mutex::new(PoolPages {
                pages: Vec::new(),
                free_stack: Vec::new(),
                stats: SemaphorePoolStats::default(),
            }),
        }
    }

    /// Pool name
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn slots_per_page(&self) -> u32 {
        SEMAPHORE_PAGE_SIZE.as_words() as u32 / self.slot_words
    }

    /// Allocate one slot, growing the pool by a page when empty
    pub fn alloc<D: Device<Memory = M>>(&self, device: &D) -> Result<GpuSemaphore<M>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some((page, slot)) = state.free_stack.pop() {
                    state.stats.allocs += 1;
                    return Ok(GpuSemaphore {
                        page: state.pages[page as usize].clone(),
                        page_index: page,
                        word: slot * self.slot_words,
                    });
                }
            }

            let mut desc = AllocDesc::new(self.name, SEMAPHORE_PAGE_SIZE, self.location);
            if self.protected {
                desc = desc.protected();
            }
            let memory = Arc::new(device.alloc_memory(&desc)?);

            let mut state = self.state.lock();
            let page = state.pages.len() as u32;
            state.pages.push(memory);
            state.stats.pages += 1;
            for slot in (0..self.slots_per_page()).rev() {
                state.free_stack.push((page, slot));
            }
            log::debug!("semaphore pool {}: grew to {} pages", self.name, page + 1);
        }
    }

    /// Return a slot to the pool
    pub fn free(&self, sem: GpuSemaphore<M>) {
        let mut state = self.state.lock();
        state.free_stack.push((sem.page_index, sem.word / self.slot_words));
        state.stats.frees += 1;
    }

    /// Get pool statistics
    pub fn stats(&self) -> SemaphorePoolStats {
        self.state.lock().stats
    }
}

// =============================================================================
// GPU SEMAPHORE
// =============================================================================

/// A slot of GPU-visible words
#[derive(Debug)]
pub struct GpuSemaphore<M> {
    page: Arc<M>,
    page_index: u32,
    word: u32,
}

impl<M: DeviceMemory> GpuSemaphore<M> {
    /// GPU address of the first word
    pub fn gpu_va(&self) -> GpuAddr {
        self.word_va(0)
    }

    /// GPU address of word `index`
    pub fn word_va(&self, index: u32) -> GpuAddr {
        self.page.gpu_va().offset((self.word + index) as u64 * 4)
    }

    /// Whether the CPU is locked out
    pub fn is_protected(&self) -> bool {
        self.page.is_protected()
    }

    /// CPU read of word `index`
    #[inline]
    pub fn read(&self, index: u32) -> Result<u32> {
        self.page.read_u32((self.word + index) as usize * 4)
    }

    /// CPU write of word `index`
    #[inline]
    pub fn write(&self, index: u32, value: u32) -> Result<()> {
        self.page.write_u32((self.word + index) as usize * 4, value)
    }
}

// =============================================================================
// TRACKING SEMAPHORE
// =============================================================================

/// Key material used to read a secure semaphore
#[derive(Clone, Copy)]
pub struct SecureRead<'a> {
    /// Session that decrypts the mirror
    pub csl: &'a dyn CslContext,
    /// Where decrypted bytes are accounted
    pub stats: &'a CryptoStats,
}

#[derive(Debug)]
struct SecureState {
    last_notifier: u32,
    ivs: Vec<CslIv>,
}

/// Fold a 32-bit payload into the 64-bit value last observed
#[inline]
pub const fn fold_payload(old: u64, payload: u32) -> u64 {
    let mut new = (old & !0xffff_ffff) | payload as u64;
    if new < old {
        new += 1 << 32;
    }
    new
}

/// Monotonic 64-bit completion counter
#[derive(Debug)]
pub struct TrackingSemaphore<M> {
    payload: GpuSemaphore<M>,
    mirror: Option<GpuSemaphore<M>>,
    completed: AtomicU64,
    queued: AtomicU64,
    max_jump: u64,
    state: AdmissionLock<SecureState>,
}

impl<M: DeviceMemory> TrackingSemaphore<M> {
    /// Plain semaphore read straight from a CPU-visible payload
    pub fn new(payload: GpuSemaphore<M>, max_jump: u64) -> Self {
        Self {
            payload,
            mirror: None,
            completed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            max_jump,
            state: AdmissionLock::new(
                LockKind::Spin,
                SecureState {
                    last_notifier: 0,
                    ivs: Vec::new(),
                },
            ),
        }
    }

    /// Secure semaphore: protected payload plus encrypted mirror
    ///
    /// `iv_slots` bounds how many releases may be outstanding at once.
    pub fn new_secure(
        payload: GpuSemaphore<M>,
        mirror: GpuSemaphore<M>,
        max_jump: u64,
        iv_slots: u32,
    ) -> Self {
        Self {
            payload,
            mirror: Some(mirror),
            completed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            max_jump,
            state: AdmissionLock::new(
                LockKind::Sleep,
                SecureState {
                    last_notifier: 0,
                    ivs: vec![CslIv::default(); iv_slots.max(1) as usize],
                },
            ),
        }
    }

    /// Whether reads go through the encrypted mirror
    pub fn is_secure(&self) -> bool {
        self.mirror.is_some()
    }

    /// GPU address of the payload
    pub fn gpu_va(&self) -> GpuAddr {
        self.payload.gpu_va()
    }

    /// GPU address of the encrypted payload copy
    pub fn mirror_va(&self) -> Option<GpuAddr> {
        self.mirror.as_ref().map(|m| m.word_va(MIRROR_PAYLOAD))
    }

    /// GPU address of the notifier word
    pub fn notifier_va(&self) -> Option<GpuAddr> {
        self.mirror.as_ref().map(|m| m.word_va(MIRROR_NOTIFIER))
    }

    /// GPU address of the crypto trailer
    pub fn trailer_va(&self) -> Option<GpuAddr> {
        self.mirror.as_ref().map(|m| m.word_va(MIRROR_TRAILER))
    }

    /// Highest value handed out to a producer
    #[inline]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    /// Cached completed value
    #[inline]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Largest accepted step between two observations
    pub fn max_jump(&self) -> u64 {
        self.max_jump
    }

    /// Hand out the next value to release
    ///
    /// Callers serialize through the owning channel's pool lock.
    pub fn advance_queued(&self) -> u64 {
        self.queued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Fast path: whether `value` is known complete without touching memory
    #[inline]
    pub fn is_value_completed(&self, value: u64) -> bool {
        value <= self.completed()
    }

    /// Whether `value` is complete, refreshing from memory on a cache miss
    pub fn poll_value_completed(&self, value: u64, secure: Option<SecureRead<'_>>) -> Result<bool> {
        if self.is_value_completed(value) {
            return Ok(true);
        }
        Ok(value <= self.update_completed(secure)?)
    }

    /// Remember the IV the device will use when it releases `value`
    pub fn record_release_iv(&self, value: u64, iv: CslIv) {
        let mut state = self.state.lock();
        let slots = state.ivs.len() as u64;
        if slots > 0 {
            state.ivs[(value % slots) as usize] = iv;
        }
    }

    /// Refresh `completed` from memory
    ///
    /// A secure semaphore must be given the session that encrypts its
    /// mirror.
    pub fn update_completed(&self, secure: Option<SecureRead<'_>>) -> Result<u64> {
        let mut state = self.state.lock();
        match (&self.mirror, secure) {
            (None, _) => {
                let payload = self.payload.read(0)?;
                self.advance_completed(payload)
            }
            (Some(mirror), Some(secure)) => {
                let Some((notifier, payload)) = read_mirror(mirror, &state, secure)? else {
                    return Ok(self.completed());
                };
                let value = self.advance_completed(payload)?;
                state.last_notifier = notifier;
                Ok(value)
            }
            (Some(_), None) => Err(Error::InvalidParameter),
        }
    }

    fn advance_completed(&self, payload: u32) -> Result<u64> {
        let old = self.completed.load(Ordering::Acquire);
        if payload == old as u32 {
            return Ok(old);
        }

        let new = fold_payload(old, payload);
        if new - old > self.max_jump {
            return Err(Error::SemaphoreJump);
        }
        if new > self.queued() {
            return Err(Error::CompletionOverrun);
        }

        self.completed.store(new, Ordering::Release);
        Ok(new)
    }

    // =========================================================================
    // GPU-side methods
    // =========================================================================

    /// Append a release of `value`
    pub fn emit_release(&self, sink: &mut dyn MethodSink, ce: &dyn CeHal, value: u64) -> Result<()> {
        ce.semaphore_release(sink, self.gpu_va(), value as u32)?;
        self.emit_publish(sink, ce)
    }

    /// Append an increment of the payload
    pub fn emit_increment(&self, sink: &mut dyn MethodSink, ce: &dyn CeHal) -> Result<()> {
        ce.semaphore_reduction_inc(sink, self.gpu_va(), u32::MAX)?;
        self.emit_publish(sink, ce)
    }

    /// Notifier to odd, encrypt the payload into the mirror, notifier to even
    fn emit_publish(&self, sink: &mut dyn MethodSink, ce: &dyn CeHal) -> Result<()> {
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let notifier = mirror.word_va(MIRROR_NOTIFIER);
        ce.semaphore_reduction_inc(sink, notifier, u32::MAX)?;
        ce.encrypt(
            sink,
            mirror.word_va(MIRROR_PAYLOAD),
            self.gpu_va(),
            4,
            mirror.word_va(MIRROR_TRAILER),
        )?;
        ce.semaphore_reduction_inc(sink, notifier, u32::MAX)
    }

    /// Give the slots back to their pools
    pub fn into_slots(self) -> (GpuSemaphore<M>, Option<GpuSemaphore<M>>) {
        (self.payload, self.mirror)
    }
}

/// Read a consistent (notifier, payload) pair from the mirror
///
/// `None` when nothing was published since the last read.
fn read_mirror<M: DeviceMemory>(
    mirror: &GpuSemaphore<M>,
    state: &SecureState,
    secure: SecureRead<'_>,
) -> Result<Option<(u32, u32)>> {
    let mut spin = SpinLoop::new(
        SpinConfig {
            max_spins: Some(NOTIFIER_RETRY_LIMIT),
            ..SpinConfig::default()
        },
        "tracking semaphore notifier",
    );

    loop {
        let notifier = mirror.read(MIRROR_NOTIFIER)?;
        if notifier == state.last_notifier {
            return Ok(None);
        }

        // Odd while the GPU is mid-publish
        if notifier % 2 == 0 {
            let mut data = [mirror.read(MIRROR_PAYLOAD)?];
            let mut words = [0u32; TRAILER_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                *word = mirror.read(MIRROR_TRAILER + i as u32)?;
            }

            if mirror.read(MIRROR_NOTIFIER)? == notifier {
                let trailer = CryptoTrailer::from_words(&words);
                let iv = state.ivs[(notifier / 2) as usize % state.ivs.len()];
                secure
                    .csl
                    .decrypt(&mut data, &iv, &trailer.tag)
                    .map_err(|_| Error::IntegrityFailure)?;
                secure.stats.add_decrypted(4);
                return Ok(Some((notifier, data[0])));
            }
        }

        spin.spin().map_err(|_| Error::IntegrityFailure)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_hal::sim::{SimConfig, SimDevice, SimMemory};

    fn plain(device: &SimDevice, max_jump: u64) -> TrackingSemaphore<SimMemory> {
        let pool = SemaphorePool::new("test", 1, BufferLocation::Sys, false);
        TrackingSemaphore::new(pool.alloc(device).unwrap(), max_jump)
    }

    fn queue_up(sem: &TrackingSemaphore<SimMemory>, n: u64) {
        for _ in 0..n {
            sem.advance_queued();
        }
    }

    #[test]
    fn test_fold_payload() {
        assert_eq!(fold_payload(0, 5), 5);
        assert_eq!(fold_payload(0xffff_fff0, 0x10), 0x1_0000_0010);
        assert_eq!(fold_payload(0x1_0000_0002, 3), 0x1_0000_0003);
    }

    #[test]
    fn test_pool_reuses_slots() {
        let device = SimDevice::new(SimConfig::new(0));
        let pool = SemaphorePool::new("test", 4, BufferLocation::Sys, false);
        let a = pool.alloc(&device).unwrap();
        let b = pool.alloc(&device).unwrap();
        assert_eq!(b.gpu_va() - a.gpu_va(), 16);
        let va = b.gpu_va();
        pool.free(b);
        assert_eq!(pool.alloc(&device).unwrap().gpu_va(), va);
        assert_eq!(pool.stats().pages, 1);
        assert_eq!(pool.stats().allocs, 3);
    }

    #[test]
    fn test_slots_do_not_alias() {
        let device = SimDevice::new(SimConfig::new(0));
        let pool = SemaphorePool::new("test", 1, BufferLocation::Sys, false);
        let a = pool.alloc(&device).unwrap();
        let b = pool.alloc(&device).unwrap();
        device.write_word(a.gpu_va(), 111).unwrap();
        device.write_word(b.gpu_va(), 222).unwrap();
        assert_eq!(a.read(0), Ok(111));
        assert_eq!(b.read(0), Ok(222));

        b.write(0, 333).unwrap();
        assert_eq!(a.read(0), Ok(111));
        assert_eq!(b.read(0), Ok(333));
    }

    #[test]
    fn test_update_is_idempotent() {
        let device = SimDevice::new(SimConfig::new(0));
        let sem = plain(&device, DEFAULT_MAX_JUMP);
        queue_up(&sem, 10);
        device.write_word(sem.gpu_va(), 7).unwrap();
        assert_eq!(sem.update_completed(None), Ok(7));
        assert_eq!(sem.update_completed(None), Ok(7));
        assert!(sem.is_value_completed(7));
        assert!(!sem.is_value_completed(8));
    }

    #[test]
    fn test_poll_refreshes_on_miss() {
        let device = SimDevice::new(SimConfig::new(0));
        let sem = plain(&device, DEFAULT_MAX_JUMP);
        queue_up(&sem, 4);
        device.write_word(sem.gpu_va(), 3).unwrap();
        assert!(!sem.is_value_completed(3));
        assert_eq!(sem.poll_value_completed(3, None), Ok(true));
        assert_eq!(sem.completed(), 3);
        assert_eq!(sem.poll_value_completed(4, None), Ok(false));

        device.write_word(sem.gpu_va(), 9).unwrap();
        assert_eq!(sem.poll_value_completed(4, None), Err(Error::CompletionOverrun));
    }

    #[test]
    fn test_wraparound() {
        let device = SimDevice::new(SimConfig::new(0));
        let sem = plain(&device, DEFAULT_MAX_JUMP);
        queue_up(&sem, (1 << 32) + 0x20);

        let mut expected = 0u64;
        for step in [0x8000_0000u64, 0x7fff_fff0, 0x30] {
            expected += step;
            device.write_word(sem.gpu_va(), expected as u32).unwrap();
            assert_eq!(sem.update_completed(None), Ok(expected));
        }
        assert_eq!(sem.completed(), 0x1_0000_0020);
    }

    #[test]
    fn test_jump_rejected() {
        let device = SimDevice::new(SimConfig::new(0));
        let sem = plain(&device, 32);
        queue_up(&sem, 100);
        device.write_word(sem.gpu_va(), 33).unwrap();
        assert_eq!(sem.update_completed(None), Err(Error::SemaphoreJump));
        assert_eq!(sem.completed(), 0);

        // A payload below the cached value looks like a 4G jump
        device.write_word(sem.gpu_va(), 20).unwrap();
        assert_eq!(sem.update_completed(None), Ok(20));
        device.write_word(sem.gpu_va(), 19).unwrap();
        assert_eq!(sem.update_completed(None), Err(Error::SemaphoreJump));
    }

    #[test]
    fn test_overrun_rejected() {
        let device = SimDevice::new(SimConfig::new(0));
        let sem = plain(&device, DEFAULT_MAX_JUMP);
        queue_up(&sem, 3);
        device.write_word(sem.gpu_va(), 4).unwrap();
        assert_eq!(sem.update_completed(None), Err(Error::CompletionOverrun));
    }

    #[test]
    fn test_secure_needs_session() {
        let device = SimDevice::new(SimConfig::confidential(0));
        let payloads = SemaphorePool::new("payload", 1, BufferLocation::Vid, true);
        let mirrors = SemaphorePool::new("mirror", MIRROR_WORDS, BufferLocation::Sys, false);
        let sem = TrackingSemaphore::new_secure(
            payloads.alloc(&device).unwrap(),
            mirrors.alloc(&device).unwrap(),
            32,
            32,
        );
        assert!(sem.is_secure());
        assert!(sem.mirror_va().is_some());
        assert_eq!(sem.update_completed(None), Err(Error::InvalidParameter));
    }
}
