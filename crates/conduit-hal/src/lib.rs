//! # CONDUIT HAL
//!
//! The collaborators the submission core consumes from the device layer:
//!
//! - [`device::Device`]: memory, queue and queue-group allocation, copy
//!   engine capabilities, ECC state
//! - [`device::HwQueue`]: one hardware command queue (GPFIFO + GPPUT +
//!   doorbell + error notifier)
//! - [`methods`]: opcode emitters for the host, copy and security engines
//! - [`crypto::CslContext`]: the CPU side of an engine encryption session
//!
//! With the `sim` feature, [`sim::SimDevice`] implements all of them with
//! an in-process GPU model.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod crypto;
pub mod device;
pub mod methods;

#[cfg(feature = "sim")]
pub mod sim;

// Re-exports
pub use crypto::{AuthTag, CryptoTrailer, CslContext, CslIv, TRAILER_WORDS};
pub use device::{
    AllocDesc, AllocFlags, CeCapsFlags, CopyEngineCaps, CopyEngineTable, Device, DeviceMemory,
    EngineType, HwQueue, QueueAllocParams, QueueGroup, QueueInfo, MAX_COPY_ENGINES,
};
pub use methods::{AcquireMode, CeHal, HostHal, MethodSink, Sec2Hal, WordBuffer};
