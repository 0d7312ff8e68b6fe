//! # Secure Launch
//!
//! When the CPU may not write a channel's GPFIFO or GPPUT, pushes are
//! encrypted and launched indirectly:
//!
//! ```text
//!   bring-up                       steady state
//!   ┌───────┐  decrypt push        ┌───────┐ A: decrypt record, call it
//!   │ SEC2  │─ write GPFIFO ──┐    │  WLC  │ B: bump LCIC put, doorbell
//!   └───────┘  bump GPPUT     │    └───┬───┘
//!                             ▼        │  ▲ put += 2
//!                         ┌───────┐    ▼  │
//!                         │  CE   │  ┌──────┐
//!                         └───────┘  │ LCIC │ releases WLC tracking
//!                                    └──────┘
//! ```
//!
//! Key material is rotated per pool once enough bytes went through it.

mod launch;
mod rotation;


use core::sync::atomic::{AtomicU64, Ordering};

use conduit_core::ByteSize;

pub(crate) use launch::{Handoff, Launch, LaunchSlots};
pub use launch::{RECORD_WORDS, SCHEDULE_WORDS};

// =============================================================================
// CRYPTO STATISTICS
// =============================================================================

/// Lifetime crypto accounting of a pool
#[derive(Debug, Default)]
pub struct CryptoStats {
    encrypted_bytes: AtomicU64,
    decrypted_bytes: AtomicU64,
    since_rotation: AtomicU64,
    rotations: AtomicU64,
}

/// Point-in-time copy of [`CryptoStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CryptoStatsSnapshot {
    /// Bytes encrypted by the CPU
    pub encrypted_bytes: u64,
    /// Bytes decrypted by the CPU
    pub decrypted_bytes: u64,
    /// Completed key rotations
    pub rotations: u64,
}

impl CryptoStatsSnapshot {
    /// Encrypted plus decrypted bytes
    pub fn total_bytes(&self) -> u64 {
        self.encrypted_bytes + self.decrypted_bytes
    }
}

impl core::ops::Add for CryptoStatsSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            encrypted_bytes: self.encrypted_bytes + rhs.encrypted_bytes,
            decrypted_bytes: self.decrypted_bytes + rhs.decrypted_bytes,
            rotations: self.rotations + rhs.rotations,
        }
    }
}

impl CryptoStats {
    /// Account bytes encrypted by the CPU
    pub fn add_encrypted(&self, bytes: u64) {
        self.encrypted_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.since_rotation.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account bytes decrypted by the CPU
    pub fn add_decrypted(&self, bytes: u64) {
        self.decrypted_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.since_rotation.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> CryptoStatsSnapshot {
        CryptoStatsSnapshot {
            encrypted_bytes: self.encrypted_bytes.load(Ordering::Relaxed),
            decrypted_bytes: self.decrypted_bytes.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }

    /// Current key generation
    pub fn generation(&self) -> u64 {
        self.rotations.load(Ordering::Acquire)
    }

    pub(crate) fn rotation_due(&self, threshold: ByteSize) -> bool {
        self.since_rotation.load(Ordering::Relaxed) >= threshold.as_bytes()
    }

    pub(crate) fn note_rotation(&self) {
        self.since_rotation.store(0, Ordering::Relaxed);
        self.rotations.fetch_add(1, Ordering::AcqRel);
    }
}
