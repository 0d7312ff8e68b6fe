//! # Synchronization Primitives
//!
//! Poll-and-yield loops, counting gates and the pool admission lock.
//!
//! There is no blocking primitive that spans a GPU completion, so every
//! wait in the submission path is a [`SpinLoop`] that re-polls progress and
//! error state between spins.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};

// =============================================================================
// SPIN LOOP
// =============================================================================

/// Tunables for busy-waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinConfig {
    /// Spins between CPU yields
    pub spins_per_yield: u32,
    /// Spins before a one-shot "still waiting" warning
    pub warn_after_spins: u64,
    /// Give up with [`Error::Timeout`] after this many spins
    pub max_spins: Option<u64>,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spins_per_yield: 64,
            warn_after_spins: 50_000_000,
            max_spins: None,
        }
    }
}

/// One busy-wait in progress
#[derive(Debug)]
pub struct SpinLoop {
    config: SpinConfig,
    what: &'static str,
    spins: u64,
    warned: bool,
}

impl SpinLoop {
    /// Start a wait described by `what`
    pub fn new(config: SpinConfig, what: &'static str) -> Self {
        Self {
            config,
            what,
            spins: 0,
            warned: false,
        }
    }

    /// Spins performed so far
    pub fn spins(&self) -> u64 {
        self.spins
    }

    /// Back off once
    pub fn spin(&mut self) -> Result<()> {
        self.spins += 1;

        let per_yield = self.config.spins_per_yield.max(1) as u64;
        if self.spins % per_yield == 0 {
            yield_now();
        } else {
            core::hint::spin_loop();
        }

        if !self.warned && self.spins >= self.config.warn_after_spins {
            log::warn!("{}: still waiting after {} spins", self.what, self.spins);
            self.warned = true;
        }

        match self.config.max_spins {
            Some(max) if self.spins >= max => Err(Error::Timeout),
            _ => Ok(()),
        }
    }
}

#[cfg(feature = "std")]
fn yield_now() {
    std::thread::yield_now();
}

#[cfg(not(feature = "std"))]
fn yield_now() {
    core::hint::spin_loop();
}

// =============================================================================
// COUNTING GATE
// =============================================================================

/// Counting semaphore with a fixed number of units
#[derive(Debug)]
pub struct CountingGate {
    available: AtomicU32,
    capacity: u32,
}

impl CountingGate {
    /// Create a gate with every unit available
    pub const fn new(capacity: u32) -> Self {
        Self {
            available: AtomicU32::new(capacity),
            capacity,
        }
    }

    /// Total units
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Units currently free
    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    /// Take one unit if free
    pub fn try_acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Take one unit, spinning until one frees up
    pub fn acquire(&self, spin: &mut SpinLoop) -> Result<()> {
        while !self.try_acquire() {
            spin.spin()?;
        }
        Ok(())
    }

    /// Return one unit
    pub fn release(&self) {
        self.bulk_release(1);
    }

    /// Take `n` units from one thread, one at a time
    ///
    /// Units already taken are returned if the wait gives up.
    pub fn bulk_acquire(&self, n: u32, spin: &mut SpinLoop) -> Result<()> {
        if n > self.capacity {
            return Err(Error::InvalidParameter);
        }
        let mut held = 0;
        while held < n {
            if self.try_acquire() {
                held += 1;
                continue;
            }
            if let Err(e) = spin.spin() {
                self.bulk_release(held);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Return `n` units
    pub fn bulk_release(&self, n: u32) {
        let prev = self.available.fetch_add(n, Ordering::AcqRel);
        debug_assert!(prev + n <= self.capacity, "counting gate over-released");
    }
}

// =============================================================================
// ADMISSION LOCK
// =============================================================================

/// Which primitive backs an [`AdmissionLock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Never sleeps while held
    Spin,
    /// Holders may block on further allocation
    Sleep,
}

/// Lock whose flavour is picked at construction
#[derive(Debug)]
pub enum AdmissionLock<T> {
    /// Spinlock
    Spin(spin::Mutex<T>),
    /// Sleeping mutex
    #[cfg(feature = "std")]
    Sleep(std::sync::Mutex<T>),
}

/// Guard returned by [`AdmissionLock::lock`]
pub enum AdmissionGuard<'a, T> {
    /// Spinlock guard
    Spin(spin::MutexGuard<'a, T>),
    /// Mutex guard
    #[cfg(feature = "std")]
    Sleep(std::sync::MutexGuard<'a, T>),
}

impl<T> AdmissionLock<T> {
    /// Create a lock of the given kind
    ///
    /// Without `std` every lock is a spinlock.
    pub fn new(kind: LockKind, value: T) -> Self {
        match kind {
            #[cfg(feature = "std")]
            LockKind::Sleep => Self::Sleep(std::sync::Mutex::new(value)),
            _ => Self::Spin(spin::Mutex::new(value)),
        }
    }

    /// Kind of lock
    pub fn kind(&self) -> LockKind {
        match self {
            Self::Spin(_) => LockKind::Spin,
            #[cfg(feature = "std")]
            Self::Sleep(_) => LockKind::Sleep,
        }
    }

    /// Acquire the lock
    pub fn lock(&self) -> AdmissionGuard<'_, T> {
        match self {
            Self::Spin(m) => AdmissionGuard::Spin(m.lock()),
            #[cfg(feature = "std")]
            Self::Sleep(m) => {
                AdmissionGuard::Sleep(m.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
            }
        }
    }

    /// Acquire the lock if uncontended
    pub fn try_lock(&self) -> Option<AdmissionGuard<'_, T>> {
        match self {
            Self::Spin(m) => m.try_lock().map(AdmissionGuard::Spin),
            #[cfg(feature = "std")]
            Self::Sleep(m) => match m.try_lock() {
                Ok(g) => Some(AdmissionGuard::Sleep(g)),
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    Some(AdmissionGuard::Sleep(p.into_inner()))
                }
                Err(std::sync::TryLockError::WouldBlock) => None,
            },
        }
    }
}

impl<T> Deref for AdmissionGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Spin(g) => g,
            #[cfg(feature = "std")]
            Self::Sleep(g) => g,
        }
    }
}

impl<T> DerefMut for AdmissionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Self::Spin(g) => g,
            #[cfg(feature = "std")]
            Self::Sleep(g) => g,
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn test_spin_loop_timeout() {
        let config = SpinConfig {
            spins_per_yield: 4,
            warn_after_spins: 2,
            max_spins: Some(10),
        };
        let mut spin = SpinLoop::new(config, "test");
        for _ in 0..9 {
            assert!(spin.spin().is_ok());
        }
        assert_eq!(spin.spin(), Err(Error::Timeout));
        assert_eq!(spin.spins(), 10);
    }

    #[test]
    fn test_gate_counts() {
        let gate = CountingGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_bulk_acquire_rolls_back() {
        let gate = CountingGate::new(3);
        assert!(gate.try_acquire());
        let config = SpinConfig {
            max_spins: Some(5),
            ..SpinConfig::default()
        };
        let mut spin = SpinLoop::new(config, "bulk");
        assert_eq!(gate.bulk_acquire(3, &mut spin), Err(Error::Timeout));
        assert_eq!(gate.available(), 2);

        gate.release();
        let mut spin = SpinLoop::new(config, "bulk");
        assert!(gate.bulk_acquire(3, &mut spin).is_ok());
        assert_eq!(gate.available(), 0);
        gate.bulk_release(3);
        assert_eq!(gate.available(), 3);
    }

    #[test]
    fn test_admission_lock_kinds() {
        let spin = AdmissionLock::new(LockKind::Spin, 1u32);
        let sleep = AdmissionLock::new(LockKind::Sleep, 1u32);
        assert_eq!(spin.kind(), LockKind::Spin);
        assert_eq!(sleep.kind(), LockKind::Sleep);

        *sleep.lock() += 1;
        {
            let _held = spin.lock();
            assert!(spin.try_lock().is_none());
        }
        assert_eq!(*sleep.lock(), 2);
        assert!(spin.try_lock().is_some());
    }
}
