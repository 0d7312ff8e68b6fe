//! # GPFIFO Bookkeeping
//!
//! CPU-side view of one channel's GPFIFO: which slots are claimed, what each
//! submitted entry was, and the provenance of the pushes behind them.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::panic::Location;

use arrayvec::ArrayString;

use conduit_core::{Error, GpuAddr, Result, Ring, RingIndex};

use crate::pushbuffer::PbToken;

/// Longest push description kept
pub const PUSH_DESCRIPTION_LEN: usize = 64;

/// Callback run once a push has retired
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

// =============================================================================
// PUSH INFO
// =============================================================================

/// Where a push came from
pub struct PushInfo {
    /// Caller-supplied description
    pub description: ArrayString<PUSH_DESCRIPTION_LEN>,
    /// Call site that began the push
    pub location: &'static Location<'static>,
    /// Run after the push retires
    pub on_complete: Option<CompletionCallback>,
}

impl PushInfo {
    /// Describe a push, truncating long descriptions
    pub fn new(description: &str, location: &'static Location<'static>) -> Self {
        let mut text = ArrayString::new();
        for c in description.chars() {
            if text.try_push(c).is_err() {
                break;
            }
        }
        Self {
            description: text,
            location,
            on_complete: None,
        }
    }
}

impl fmt::Debug for PushInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushInfo")
            .field("description", &self.description.as_str())
            .field("location", &self.location)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl fmt::Display for PushInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' started at {}:{}",
            self.description,
            self.location.file(),
            self.location.line()
        )
    }
}

// =============================================================================
// GPFIFO ENTRY
// =============================================================================

/// One submitted GPFIFO slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GpfifoEntry {
    /// Never written or already retired
    #[default]
    Empty,
    /// A push out of the pushbuffer
    Push {
        /// Pushbuffer handle
        token: PbToken,
        /// Address the GPU fetches from
        gpu_va: GpuAddr,
        /// Size of the push
        bytes: u32,
        /// Tracking value released at the end of the push
        tracking_value: u64,
        /// Push info slot
        info: u32,
    },
    /// A raw entry written without a push
    Control {
        /// Entry payload
        payload: u64,
        /// Tracking value that covers it
        tracking_value: u64,
    },
}

impl GpfifoEntry {
    /// Value the channel's tracking semaphore reaches once this entry ran
    pub fn tracking_value(&self) -> u64 {
        match *self {
            GpfifoEntry::Empty => 0,
            GpfifoEntry::Push { tracking_value, .. } => tracking_value,
            GpfifoEntry::Control { tracking_value, .. } => tracking_value,
        }
    }
}

/// An entry taken off the ring
pub(crate) struct Retired {
    pub token: Option<PbToken>,
    pub callback: Option<CompletionCallback>,
}

/// Ring statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    /// Entries written
    pub submitted: u64,
    /// Control entries among them
    pub control: u64,
    /// Entries retired
    pub retired: u64,
}

// =============================================================================
// CHANNEL RING
// =============================================================================

/// CPU bookkeeping for one GPFIFO
#[derive(Debug)]
pub struct ChannelRing {
    ring: Ring,
    /// Next slot the CPU writes
    cpu_put: RingIndex,
    /// Oldest slot not yet retired
    gpu_get: RingIndex,
    /// Slots reserved but not yet written
    in_flight: u32,
    entries: Vec<GpfifoEntry>,
    infos: Vec<Option<PushInfo>>,
    free_infos: Vec<u32>,
    stats: RingStats,
}

impl ChannelRing {
    /// Bookkeeping for an `entries`-slot GPFIFO
    pub fn new(entries: u32) -> Result<Self> {
        let ring = Ring::new(entries)?;
        Ok(Self {
            ring,
            cpu_put: RingIndex::ZERO,
            gpu_get: RingIndex::ZERO,
            in_flight: 0,
            entries: (0..entries).map(|_| GpfifoEntry::Empty).collect(),
            infos: (0..entries).map(|_| None).collect(),
            free_infos: (0..entries).rev().collect(),
            stats: RingStats::default(),
        })
    }

    /// Ring geometry
    pub fn ring(&self) -> Ring {
        self.ring
    }

    /// Next slot the CPU writes
    pub fn put(&self) -> RingIndex {
        self.cpu_put
    }

    /// Oldest slot not yet retired
    pub fn get(&self) -> RingIndex {
        self.gpu_get
    }

    /// Slots reserved but not yet written
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Entries submitted but not retired
    pub fn pending(&self) -> u32 {
        self.ring.distance(self.gpu_get, self.cpu_put)
    }

    /// Slots still claimable
    pub fn available(&self) -> u32 {
        self.ring.available(self.gpu_get, self.cpu_put, self.in_flight)
    }

    /// Get ring statistics
    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// Claim `count` slots if that many are free
    pub fn try_claim(&mut self, count: u32) -> bool {
        if self.available() < count {
            return false;
        }
        self.in_flight += count;
        true
    }

    /// Return claimed slots that will not be written
    pub fn unclaim(&mut self, count: u32) {
        self.in_flight = self.in_flight.saturating_sub(count);
    }

    /// Claim every free slot for good
    pub fn claim_all(&mut self) -> u32 {
        let count = self.available();
        self.in_flight += count;
        count
    }

    /// Store the provenance of a push
    pub fn alloc_info(&mut self, info: PushInfo) -> Result<u32> {
        let slot = self.free_infos.pop().ok_or(Error::Busy)?;
        self.infos[slot as usize] = Some(info);
        Ok(slot)
    }

    /// Provenance of a push
    pub fn info(&self, slot: u32) -> Option<&PushInfo> {
        self.infos.get(slot as usize).and_then(Option::as_ref)
    }

    /// Mutable provenance of a push
    pub fn info_mut(&mut self, slot: u32) -> Option<&mut PushInfo> {
        self.infos.get_mut(slot as usize).and_then(Option::as_mut)
    }

    /// Drop the provenance of a push
    pub fn free_info(&mut self, slot: u32) -> Option<PushInfo> {
        let info = self.infos.get_mut(slot as usize)?.take()?;
        self.free_infos.push(slot);
        Some(info)
    }

    /// Turn one claimed slot into a submitted entry
    ///
    /// Returns the slot written.
    pub fn commit(&mut self, entry: GpfifoEntry) -> Result<RingIndex> {
        if self.in_flight == 0 {
            return Err(Error::InvalidState);
        }
        let slot = self.cpu_put;
        self.entries[slot.as_usize()] = entry;
        self.cpu_put = self.ring.next(slot);
        self.in_flight -= 1;
        self.stats.submitted += 1;
        if matches!(entry, GpfifoEntry::Control { .. }) {
            self.stats.control += 1;
        }
        Ok(slot)
    }

    /// Oldest entry not yet retired
    pub fn oldest_pending(&self) -> Option<&GpfifoEntry> {
        if self.pending() == 0 {
            return None;
        }
        Some(&self.entries[self.gpu_get.as_usize()])
    }

    /// Entry at `slot`
    pub fn entry(&self, slot: RingIndex) -> &GpfifoEntry {
        &self.entries[slot.as_usize()]
    }

    /// Retire the oldest entry if it is complete or `force` is set
    pub(crate) fn retire_next(&mut self, completed: u64, force: bool) -> Option<Retired> {
        let entry = *self.oldest_pending()?;
        if !force && entry.tracking_value() > completed {
            return None;
        }

        let get = self.gpu_get;
        self.entries[get.as_usize()] = GpfifoEntry::Empty;
        self.gpu_get = self.ring.next(get);
        self.stats.retired += 1;

        Some(match entry {
            GpfifoEntry::Push { token, info, .. } => Retired {
                token: Some(token),
                callback: self.free_info(info).and_then(|i| i.on_complete),
            },
            _ => Retired {
                token: None,
                callback: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(value: u64) -> GpfifoEntry {
        GpfifoEntry::Control {
            payload: 0,
            tracking_value: value,
        }
    }

    #[test]
    fn test_sentinel_slot() {
        let mut ring = ChannelRing::new(32).unwrap();
        assert_eq!(ring.available(), 31);
        assert!(ring.try_claim(31));
        assert!(!ring.try_claim(1));
        for i in 0..31 {
            ring.commit(control(i + 1)).unwrap();
        }
        assert_eq!(ring.pending(), 31);
        assert_eq!(ring.available(), 0);
        assert!(ring.ring().check(ring.get(), ring.put(), ring.in_flight()).is_ok());

        assert!(ring.retire_next(1, false).is_some());
        assert_eq!(ring.available(), 1);
    }

    #[test]
    fn test_retire_in_order() {
        let mut ring = ChannelRing::new(32).unwrap();
        assert!(ring.try_claim(3));
        for value in 1..=3 {
            ring.commit(control(value)).unwrap();
        }
        assert!(ring.retire_next(0, false).is_none());
        assert!(ring.retire_next(2, false).is_some());
        assert!(ring.retire_next(2, false).is_some());
        assert!(ring.retire_next(2, false).is_none());
        assert!(ring.retire_next(2, true).is_some());
        assert_eq!(ring.pending(), 0);
        assert_eq!(ring.stats().retired, 3);
    }

    #[test]
    fn test_commit_needs_claim() {
        let mut ring = ChannelRing::new(32).unwrap();
        assert_eq!(ring.commit(control(1)), Err(Error::InvalidState));
        assert_eq!(ring.claim_all(), 31);
        ring.unclaim(31);
        assert_eq!(ring.available(), 31);
    }

    #[test]
    fn test_push_info() {
        let mut ring = ChannelRing::new(32).unwrap();
        let long = "x".repeat(200);
        let slot = ring.alloc_info(PushInfo::new(&long, Location::caller())).unwrap();
        let info = ring.info(slot).unwrap();
        assert_eq!(info.description.len(), PUSH_DESCRIPTION_LEN);
        assert!(info.location.file().ends_with("gpfifo.rs"));
        assert!(ring.free_info(slot).is_some());
        assert!(ring.free_info(slot).is_none());
    }
}
