//! # CONDUIT Command Submission
//!
//! Channel pools, GPFIFO reservation, pushbuffer allocation and completion
//! tracking for the copy engines of one GPU, plus the indirect launch path
//! used when confidential computing keeps the CPU out of the queues.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         ChannelManager                            │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │ Reservation  │───▶│    Push      │───▶│  GPFIFO entry    │     │
//! │  │ (pool, slot) │    │ (pushbuffer) │    │  + tracking      │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                   │               │
//! │           direct ◄──────────────┬─────────────────┤               │
//! │           proxy  ◄──────────────┤                 │               │
//! │                          ┌──────▼──────┐   ┌──────▼──────┐        │
//! │                          │ SEC2 launch │   │ WLC / LCIC  │        │
//! │                          │  (bring-up) │   │  schedule   │        │
//! │                          └─────────────┘   └─────────────┘        │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Push Flow
//!
//! 1. Reserve a GPFIFO slot on a channel of the wanted type
//! 2. Begin a push: claim pushbuffer space, record methods
//! 3. End: append the tracking release, commit the entry, submit
//! 4. Progress updates fold the tracking payload back into 64 bits and
//!    retire entries, running completion callbacks

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod ce_select;
pub mod channel;
pub mod config;
pub mod context;
pub mod gpfifo;
pub mod manager;
pub mod pool;
pub mod push;
pub mod pushbuffer;
pub mod secure;
pub mod semaphore;

// Re-exports
pub use ce_select::{CeSelection, select_copy_engines};
pub use channel::{Channel, ChannelType};
pub use config::{ChannelManagerConfig, MAX_PUSH_SIZE};
pub use gpfifo::{GpfifoEntry, PushInfo, RingStats};
pub use manager::{ChannelId, ChannelManager, ChannelRef, Reservation};
pub use pool::{ChannelPool, PoolFlags, PoolType};
pub use push::Push;
pub use pushbuffer::{Pushbuffer, PushbufferStats};
pub use secure::{CryptoStats, CryptoStatsSnapshot};
pub use semaphore::{GpuSemaphore, SemaphorePool, TrackingSemaphore};
